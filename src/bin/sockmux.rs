use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sockmux::{
    setup_local_tracing, setup_tracing, AppResult, Disposition, EventId, Line, LineHandler,
    Resume, Server, ServerConfig, ServerContext, ServerHooks, When,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<PathBuf>,
    /// listening port, overrides the config file
    #[arg(short, long)]
    pub port: Option<u16>,
    /// also log to hourly files in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    /// stop after this many seconds without connections
    #[arg(long)]
    pub run_for: Option<u64>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Line chat demo: every line is echoed back to its sender and relayed to
/// the other connections.
///
/// Commands: `quit`, `shutdown`, `who`, `slow <n>` (answers one dot per
/// pass through a continuation).
#[derive(Default)]
struct ChatHandler {
    lines_seen: u64,
}

impl ChatHandler {
    fn broadcast(ctx: &mut ServerContext<String>, from: usize, text: &str) {
        let others: Vec<usize> = ctx.slots().filter(|&slot| slot != from).collect();
        for slot in others {
            if let Some(mut out) = ctx.output(slot) {
                out.write_str(&format!("[{}] {}\r\n", from, text));
            }
        }
    }
}

impl ServerHooks for ChatHandler {
    type EventData = String;

    fn on_connect(&mut self, ctx: &mut ServerContext<String>, slot: usize) {
        let active = ctx.active_connections();
        let max = ctx.max_connections();
        if let Some(mut out) = ctx.output(slot) {
            out.write_str(&format!("welcome, you are #{} ({}/{})\r\n", slot, active, max));
        }
        Self::broadcast(ctx, slot, "joined");
    }

    fn on_disconnect(&mut self, ctx: &mut ServerContext<String>, slot: usize) {
        Self::broadcast(ctx, slot, "left");
    }

    fn on_timed_event(
        &mut self,
        ctx: &mut ServerContext<String>,
        _id: EventId,
        label: &mut String,
    ) -> bool {
        info!(
            %label,
            active = ctx.active_connections(),
            lines = self.lines_seen,
            "status"
        );
        true
    }

    fn on_event_done(&mut self, _ctx: &mut ServerContext<String>, label: String) {
        info!(%label, "event finished");
    }
}

impl LineHandler for ChatHandler {
    fn on_line_received(
        &mut self,
        ctx: &mut ServerContext<String>,
        slot: usize,
        line: Line,
    ) -> Disposition<Self> {
        self.lines_seen += 1;
        let command = line.canonical_line().to_string();
        let mut words = command.split_whitespace();
        match (words.next(), words.next()) {
            (Some("quit"), _) => return Disposition::Disconnect,
            (Some("shutdown"), _) => {
                ctx.request_shutdown();
                return Disposition::Continue;
            }
            (Some("who"), _) => {
                let peers: Vec<String> = ctx
                    .slots()
                    .map(|s| format!("#{} {:?}", s, ctx.peer_addr(s)))
                    .collect();
                if let Some(mut out) = ctx.output(slot) {
                    out.write_str(&format!("{}\r\n", peers.join(", ")));
                }
                return Disposition::Continue;
            }
            (Some("slow"), Some(n)) => {
                let mut left: u32 = n.parse().unwrap_or(3);
                return Disposition::<Self>::suspend(move |_chat: &mut ChatHandler, ctx, slot| {
                    let Some(mut out) = ctx.output(slot) else {
                        return Resume::Done;
                    };
                    if left == 0 {
                        out.write_str("\r\n");
                        return Resume::Done;
                    }
                    out.write_str(".");
                    left -= 1;
                    Resume::Pending
                });
            }
            _ => {}
        }
        if line.is_truncated() {
            warn!(slot, "line cut at maximum length");
        }
        if let Some(mut out) = ctx.output(slot) {
            out.write_str(&format!("{}\r\n", line.text()));
        }
        Self::broadcast(ctx, slot, line.text());
        Disposition::Continue
    }
}

fn main() -> AppResult<()> {
    let commandline = CommandLine::parse();
    let level = log_level(commandline.verbose);
    let _guard = match &commandline.log_dir {
        Some(dir) => Some(setup_tracing(dir, level)?),
        None => {
            setup_local_tracing(level)?;
            None
        }
    };

    let mut config = match &commandline.conf {
        Some(path) => ServerConfig::set_up_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = commandline.port {
        config.network.port = port;
    }
    config.validate()?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let mut server = Server::lines(config, ChatHandler::default())?;
    if let Some(addr) = server.local_addr() {
        println!("sockmux listening on {}", addr);
    }
    server.add_event(
        When::In(Duration::from_secs(60)),
        "status".to_string(),
        Duration::from_secs(60),
    );

    let timeout = commandline
        .run_for
        .map_or(Duration::MAX, Duration::from_secs);
    server.run(timeout)?;
    server.shutdown();
    Ok(())
}
