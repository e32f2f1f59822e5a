//! Installers applied when a run enters monitoring.
//!
//! A [`Monitor`] gets the live session once, after the debugger is attached, and
//! registers whatever it needs: breakpoints with callbacks, output observers,
//! matchers or finish hooks.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use regex::Regex;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::breakpoints::{breakpoint_callback, Hits, Location};
use crate::error::GraderError;
use crate::gdb::Debugger;
use crate::matcher::OutputMatcher;
use crate::session::RunSession;
use crate::{CallbackResult, Control, Result};

pub type Monitor =
    Box<dyn for<'a> FnOnce(&'a mut RunSession) -> BoxFuture<'a, Result<()>> + Send>;

/// Boxes a closure as a [`Monitor`].
pub fn monitor<F>(f: F) -> Monitor
where
    F: for<'a> FnOnce(&'a mut RunSession) -> BoxFuture<'a, Result<()>> + Send + 'static,
{
    Box::new(f)
}

/// Runs `callback` each time execution reaches `location`, at most `times` times
/// (`0` for no limit).
pub fn call_on_breakpoint<F>(location: impl Into<Location>, times: u32, callback: F) -> Monitor
where
    F: for<'a> FnMut(&'a mut Debugger) -> BoxFuture<'a, CallbackResult> + Send + Sync + 'static,
{
    let location = location.into();
    let callback = breakpoint_callback(callback);
    monitor(move |session: &mut RunSession| {
        async move {
            session
                .debugger_mut()?
                .install(location, Some(callback), Hits::times(times))
                .await?;
            Ok::<_, GraderError>(())
        }
        .boxed()
    })
}

/// Expects execution to reach `location` `times` times without running anything.
pub fn on_breakpoint(location: impl Into<Location>, times: u32) -> Monitor {
    let location = location.into();
    monitor(move |session: &mut RunSession| {
        async move {
            session
                .debugger_mut()?
                .install(location, None, Hits::times(times))
                .await?;
            Ok::<_, GraderError>(())
        }
        .boxed()
    })
}

/// Sets a plain debugger breakpoint that halts the kernel without a registry entry.
pub fn stop_breakpoint(location: impl Into<Location>) -> Monitor {
    let location = location.into();
    monitor(move |session: &mut RunSession| {
        async move {
            let address = location.resolve(session.symbols())?;
            session.debugger_mut()?.set_breakpoint(address).await?;
            debug!("halting breakpoint set at {location} ({address:#x})");
            Ok::<_, GraderError>(())
        }
        .boxed()
    })
}

/// Calls `callback` for every complete output line that matches `pattern` at its
/// start.
pub fn call_on_line<F>(pattern: &str, mut callback: F) -> Result<Monitor>
where
    F: FnMut(&str) -> CallbackResult + Send + 'static,
{
    let regex = Regex::new(pattern)?;
    Ok(monitor(move |session: &mut RunSession| {
        async move {
            let mut pending = Vec::new();
            session.target_mut()?.observe(Box::new(move |chunk: &[u8]| {
                pending.extend_from_slice(chunk);
                let mut control = Control::Continue;
                while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                    let rest = pending.split_off(newline + 1);
                    let line = std::mem::replace(&mut pending, rest);
                    let line = String::from_utf8_lossy(&line[..newline]);
                    if regex.find(&line).is_some_and(|m| m.start() == 0) {
                        control = control.merge(callback(&line)?);
                    }
                }
                Ok(control)
            }));
            Ok::<_, GraderError>(())
        }
        .boxed()
    }))
}

/// Ends the run successfully at the first output line matching `pattern`.
pub fn stop_on_line(pattern: &str) -> Result<Monitor> {
    call_on_line(pattern, |_| Ok(Control::Stop))
}

/// Feeds all output, including what was printed while booting, to `matcher` and
/// verifies it when the run ends. A matcher already satisfied by the boot output
/// ends the run before the target is resumed.
pub fn expect_output(matcher: OutputMatcher) -> Monitor {
    monitor(move |session: &mut RunSession| {
        async move {
            let shared = Arc::new(Mutex::new(matcher));
            let target = session.target_mut()?;
            let booted = {
                let mut matcher = shared
                    .lock()
                    .map_err(|_| GraderError::assertion("output matcher poisoned"))?;
                matcher.feed(target.output().as_bytes())
            };
            let observed = Arc::clone(&shared);
            target.observe(Box::new(move |chunk: &[u8]| {
                let mut matcher = observed
                    .lock()
                    .map_err(|_| GraderError::assertion("output matcher poisoned"))?;
                Ok(matcher.feed(chunk))
            }));
            session.add_matcher(shared);
            if booted.is_stop() {
                session.cancel();
            }
            Ok::<_, GraderError>(())
        }
        .boxed()
    })
}

enum SaveMessage {
    Chunk(Vec<u8>),
    Flush(oneshot::Sender<()>),
}

/// Streams target output to `path`.
///
/// When the run fails the log is copied to `<path>.<test>`, named after the test
/// the runner is working on; a stale copy from an earlier failure is removed when
/// the run passes.
pub fn save(path: impl Into<PathBuf>) -> Monitor {
    let path = path.into();
    monitor(move |session: &mut RunSession| {
        async move {
            let path = session.config().resolve(&path);
            let file = File::create(&path).await?;
            let saved = failure_log_path(&path, session.test_name());

            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(write_output(file, rx));
            let chunks = tx.clone();
            session.target_mut()?.observe(Box::new(move |chunk: &[u8]| {
                let _ = chunks.send(SaveMessage::Chunk(chunk.to_vec()));
                Ok(Control::Continue)
            }));

            session.on_finish(Box::new(move |failed| {
                async move {
                    let (done, flushed) = oneshot::channel();
                    if tx.send(SaveMessage::Flush(done)).is_ok() {
                        let _ = flushed.await;
                    }
                    if failed {
                        if tokio::fs::copy(&path, &saved).await.is_ok() {
                            println!("    QEMU output saved to {}", saved.display());
                        }
                    } else if tokio::fs::remove_file(&saved).await.is_ok() {
                        println!("    (Old {} failure log removed)", saved.display());
                    }
                }
                .boxed()
            }));
            Ok::<_, GraderError>(())
        }
        .boxed()
    })
}

fn failure_log_path(path: &Path, test: Option<&str>) -> PathBuf {
    let mut saved = path.as_os_str().to_owned();
    saved.push(".");
    saved.push(test.unwrap_or("fail"));
    PathBuf::from(saved)
}

async fn write_output(mut file: File, mut rx: mpsc::UnboundedReceiver<SaveMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            SaveMessage::Chunk(chunk) => {
                if let Err(e) = file.write_all(&chunk).await {
                    warn!("Failed to save target output: {e}");
                    return;
                }
            }
            SaveMessage::Flush(done) => {
                let _ = file.flush().await;
                let _ = done.send(());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_line_pattern_is_rejected_up_front() {
        assert!(matches!(stop_on_line("("), Err(GraderError::Pattern(_))));
        assert!(call_on_line("^Hello", |_| Ok(Control::Continue)).is_ok());
    }

    #[test]
    fn failure_log_is_named_after_the_test() {
        let path = Path::new("/tmp/qemu.out");
        assert_eq!(
            failure_log_path(path, Some("hello_output")),
            PathBuf::from("/tmp/qemu.out.hello_output")
        );
        assert_eq!(failure_log_path(path, None), PathBuf::from("/tmp/qemu.out.fail"));
    }
}
