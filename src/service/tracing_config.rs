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

use std::path::Path;

use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::{AppError, AppResult};

/// Keeps the non-blocking file writer alive, drop it only when the process exits.
pub struct LogGuard {
    _worker_guard: WorkerGuard,
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Console logging only. Safe to call more than once, later calls are ignored,
/// which is what the test fixtures rely on.
pub fn setup_local_tracing() -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter("info"))
        .try_init();
    Ok(())
}

/// Console plus hourly rolling file under `log_dir`.
pub fn setup_tracing<P: AsRef<Path>>(log_dir: P, default_directive: &str) -> AppResult<LogGuard> {
    dotenv().ok();
    let file_appender = tracing_appender::rolling::hourly(log_dir.as_ref(), "stonenet.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    // write to the console and the file at the same time
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(default_directive))
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("tracing already set up: {}", e)))?;

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}
