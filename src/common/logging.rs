// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Process-wide tracing setup with a glog-flavored line format:
//!
//! ```text
//! I20260802 14:03:21.184291 worker-3 src/exec/join/node.rs:284] message
//! ```
//!
//! One line per event on stderr: severity letter, local timestamp with
//! microseconds, thread name (or raw id), then source location.

use std::fmt;
use std::sync::OnceLock;

use chrono::Local;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

use crate::petrel_config;

static INIT: OnceLock<()> = OnceLock::new();

fn severity_letter(level: &tracing::Level) -> char {
    match *level {
        tracing::Level::ERROR => 'E',
        tracing::Level::WARN => 'W',
        tracing::Level::INFO => 'I',
        tracing::Level::DEBUG => 'D',
        tracing::Level::TRACE => 'T',
    }
}

struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{}{} ",
            severity_letter(meta.level()),
            Local::now().format("%Y%m%d %H:%M:%S%.6f")
        )?;

        let current = std::thread::current();
        match current.name() {
            Some(name) => write!(writer, "{name} ")?,
            None => {
                // Unnamed threads fall back to the runtime id, digits only.
                let id = format!("{:?}", current.id());
                let digits = id
                    .strip_prefix("ThreadId(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .unwrap_or(&id);
                write!(writer, "{digits} ")?;
            }
        }

        write!(
            writer,
            "{}:{}] ",
            meta.file().unwrap_or("<unknown>"),
            meta.line().unwrap_or(0)
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the subscriber with an explicit filter expression. Safe to call
/// any number of times; only the first call takes effect.
pub fn init_with_filter(filter: &str) {
    let filter = filter.to_string();
    INIT.get_or_init(|| {
        // Escape codes only make sense on a terminal; files get plain text.
        let ansi = atty::is(atty::Stream::Stderr);
        let _ = tracing_fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_writer(std::io::stderr)
            .with_ansi(ansi)
            .event_format(LineFormat)
            .try_init();
    });
}

/// Install the subscriber using the application config's log filter, or the
/// info level when no config is present.
pub fn init() {
    let filter = petrel_config::config()
        .map(|cfg| cfg.effective_log_filter())
        .unwrap_or_else(|_| "info".to_string());
    init_with_filter(&filter);
}

pub use tracing::{debug, error, info, trace, warn};
