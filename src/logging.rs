use tokio::sync::broadcast;
use tracing_subscriber::fmt::MakeWriter;

/// Capacity of the live log channel behind `GET /api/logs`.
pub(crate) const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Tees every formatted tracing line to the live log channel and, unless
/// suppressed, to stdout.
#[derive(Clone)]
pub(crate) struct SseMakeWriter {
    pub sender: broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for SseMakeWriter {
    type Writer = SseWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SseWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct SseWriter {
    sender: broadcast::Sender<String>,
    suppress_stdout: bool,
}

impl std::io::Write for SseWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = String::from_utf8_lossy(buf).trim_end().to_string();
        let _ = self.sender.send(msg); // no subscribers is fine
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Install the global subscriber for the daemon. Returns the sender the
/// API server subscribes log viewers to.
pub(crate) fn init_daemon_logging(level: tracing::Level) -> broadcast::Sender<String> {
    let (log_tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(SseMakeWriter {
            sender: log_tx.clone(),
            suppress_stdout: false,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // keep an already installed subscriber
    log_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn writer_forwards_trimmed_lines() {
        let (tx, mut rx) = broadcast::channel(4);
        let make = SseMakeWriter {
            sender: tx,
            suppress_stdout: true,
        };
        let mut writer = make.make_writer();
        let n = writer.write(b"INFO alert published\n").unwrap();
        assert_eq!(n, 21);
        assert_eq!(rx.try_recv().unwrap(), "INFO alert published");
    }

    #[test]
    fn writer_without_subscribers_still_succeeds() {
        let (tx, rx) = broadcast::channel::<String>(4);
        drop(rx);
        let mut writer = SseMakeWriter {
            sender: tx,
            suppress_stdout: true,
        }
        .make_writer();
        assert!(writer.write(b"dropped\n").is_ok());
        assert!(writer.flush().is_ok());
    }
}
