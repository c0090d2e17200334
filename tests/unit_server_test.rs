use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use rstest::{fixture, rstest};
use sockmux::{
    setup_local_tracing, AppError, AppResult, Disposition, Framing, ObjectHandler, Server,
    ServerConfig, ServerContext, ServerHooks, UnitCheck, UnitMode, UnitParser,
};

#[fixture]
#[once]
fn setup() {
    let _ = setup_local_tracing("debug");
}

/// `<...>` records without nesting.
#[derive(Default)]
struct AngleParser;

impl UnitParser for AngleParser {
    type Unit = String;

    fn check(&self, buf: &[u8]) -> UnitCheck {
        match (buf.first(), buf.last()) {
            (Some(b'<'), Some(b'>')) if buf.len() > 1 => UnitCheck::Complete,
            (Some(b'<'), _) if !buf[1..].contains(&b'<') => UnitCheck::Incomplete,
            _ => UnitCheck::Invalid,
        }
    }

    fn parse(&self, buf: &[u8]) -> AppResult<(String, usize)> {
        let end = buf
            .iter()
            .position(|&b| b == b'>')
            .ok_or_else(|| AppError::MalformedProtocol("unterminated record".to_string()))?;
        Ok((String::from_utf8_lossy(&buf[1..end]).into_owned(), end + 1))
    }
}

#[derive(Default)]
struct Collector {
    parser: AngleParser,
    units: Vec<(usize, String)>,
    disconnects: Vec<usize>,
}

impl ServerHooks for Collector {
    type EventData = ();

    fn on_disconnect(&mut self, _ctx: &mut ServerContext<()>, slot: usize) {
        self.disconnects.push(slot);
    }
}

impl ObjectHandler for Collector {
    type Parser = AngleParser;

    fn parser(&self) -> &AngleParser {
        &self.parser
    }

    fn on_object_received(
        &mut self,
        ctx: &mut ServerContext<()>,
        slot: usize,
        unit: String,
    ) -> Disposition<Self> {
        let keep = unit != "close";
        if let Some(mut out) = ctx.output(slot) {
            out.write_str(&format!("<ok {}>", unit));
        }
        self.units.push((slot, unit));
        keep.into()
    }
}

fn start() -> AppResult<Server<UnitMode<Collector>>> {
    let mut config = ServerConfig::default();
    config.network.max_connections = 4;
    Server::units(config, Collector::default())
}

fn connect(server: &mut Server<UnitMode<Collector>>) -> TcpStream {
    let addr = server.local_addr().expect("listening");
    let client = TcpStream::connect(addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    let before = server.active_connections();
    for _ in 0..500 {
        if server.active_connections() > before {
            break;
        }
        server.run_once(Duration::from_millis(10)).expect("pass");
    }
    assert_eq!(server.active_connections(), before + 1);
    client
}

fn pump_until(
    server: &mut Server<UnitMode<Collector>>,
    done: impl Fn(&Collector) -> bool,
) {
    for _ in 0..500 {
        if done(server.handler()) {
            return;
        }
        server.run_once(Duration::from_millis(10)).expect("pass");
    }
    assert!(done(server.handler()), "condition never reached");
}

#[rstest]
fn test_units_reassembled_across_writes(_setup: ()) -> AppResult<()> {
    let mut server = start()?;
    assert_eq!(server.context().config().protocol.framing, Framing::Units);
    let mut client = connect(&mut server);

    client.write_all(b"  <ab")?;
    for _ in 0..5 {
        server.run_once(Duration::from_millis(10))?;
    }
    assert!(server.handler().units.is_empty());

    client.write_all(b"c> <d>\n<e>")?;
    pump_until(&mut server, |c| c.units.len() == 3);
    assert_eq!(
        server.handler().units,
        vec![
            (0, "abc".to_string()),
            (0, "d".to_string()),
            (0, "e".to_string())
        ]
    );

    let mut reply = vec![0u8; b"<ok abc><ok d><ok e>".len()];
    client.read_exact(&mut reply)?;
    assert_eq!(reply, b"<ok abc><ok d><ok e>");
    Ok(())
}

#[rstest]
fn test_false_from_hook_disconnects(_setup: ()) -> AppResult<()> {
    let mut server = start()?;
    let mut client = connect(&mut server);
    client.write_all(b"<close><ignored>")?;
    pump_until(&mut server, |c| !c.disconnects.is_empty());
    assert_eq!(server.handler().units, vec![(0, "close".to_string())]);
    assert_eq!(server.active_connections(), 0);
    Ok(())
}

#[rstest]
fn test_invalid_unit_drops_only_its_connection(_setup: ()) -> AppResult<()> {
    let mut server = start()?;
    let mut good = connect(&mut server);
    let mut bad = connect(&mut server);

    bad.write_all(b"garbage")?;
    pump_until(&mut server, |c| c.disconnects == vec![1]);

    good.write_all(b"<fine>")?;
    pump_until(&mut server, |c| c.units.len() == 1);
    assert_eq!(server.handler().units, vec![(0, "fine".to_string())]);
    assert_eq!(server.active_connections(), 1);
    Ok(())
}

#[rstest]
fn test_incomplete_unit_dropped_at_close(_setup: ()) -> AppResult<()> {
    let mut server = start()?;
    let mut client = connect(&mut server);
    // `parse` rejects `<tw`, so the default end-of-stream completion fails
    client.write_all(b"<one><tw")?;
    drop(client);
    pump_until(&mut server, |c| !c.disconnects.is_empty());
    assert_eq!(server.handler().units, vec![(0, "one".to_string())]);
    Ok(())
}
