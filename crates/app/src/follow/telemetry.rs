//! Telemetry helpers for tracing output and Prometheus metrics.

use std::{io, thread};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::Subscriber;
use tracing_subscriber::{filter::EnvFilter, fmt, fmt::MakeWriter, prelude::*};

use crate::follow::config::TelemetryOptions;

/// Install the global tracing subscriber. `RUST_LOG` wins over `verbose`.
///
/// Logs go to stderr: stdout carries side-channel replies.
pub(crate) fn init_tracing(verbose: bool) {
    // Leaves an already installed subscriber in place.
    let _ = log_subscriber(verbose, io::stderr).try_init();
}

fn log_subscriber<W>(verbose: bool, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry().with(
        fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::uptime())
            .with_writer(writer)
            .with_filter(env_filter),
    )
}

/// Serve metrics over HTTP when an address is configured. Without one the
/// `metrics` macros stay no-ops.
pub(crate) fn init_metrics(opts: &TelemetryOptions) -> Result<()> {
    let Some(addr) = opts.metrics_addr else {
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("failed to start metrics listener on {addr}"))?;
    tracing::info!("Prometheus metrics available at http://{addr}/metrics");
    Ok(())
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::follow::side_channel::Replies;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn log_lines_stay_off_the_reply_stream() {
        let logs = Capture::default();
        let replies_out = Capture::default();
        let replies = Replies::new(Box::new(replies_out.clone()));

        let subscriber = log_subscriber(false, {
            let logs = logs.clone();
            move || logs.clone()
        });
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("telemetry went quiet");
            replies.send_line(r#"{"mode":"idle"}"#).unwrap();
            tracing::warn!("status sent");
        });

        assert_eq!(replies_out.text(), "{\"mode\":\"idle\"}\n");
        let logs = logs.text();
        assert!(logs.contains("telemetry went quiet"));
        assert!(logs.contains("status sent"));
    }
}
