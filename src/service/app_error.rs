// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol unit: {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    TracingError(#[from] tracing_subscriber::util::TryInitError),

    /// growing a buffer to the given size failed, buffered data is untouched
    #[error("buffer growth to {0} bytes failed")]
    BufferGrowth(usize),

    /// marker error
    #[error("incomplete")]
    Incomplete,
}

impl AppError {
    /// The failed operation may be retried on a later pass without losing
    /// any buffered data.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::BufferGrowth(_) | AppError::Incomplete)
    }
}
