//! Terminal implementations of the sign-in UI and user notifications.
//!
//! Standard input is read on a detached thread: a blocking read cannot be
//! cancelled, and a runtime-owned reader would hold up shutdown.

use std::future::Future;
use std::io::BufRead;
use std::sync::Arc;

use colab_assignments::Notifier;
use colab_auth::{BoxFuture, LoginUi, ProgressGuard, UriHandler};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Prompts and progress on stderr; answers and pasted redirect URLs on stdin.
pub struct TerminalUi {
    uri_handler: UriHandler,
    lines: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
}

impl TerminalUi {
    /// Starts reading stdin and forwards pasted URLs to `uri_handler`.
    pub fn new(uri_handler: UriHandler) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || forward_lines(std::io::stdin().lock(), tx));
        Self::with_lines(uri_handler, rx)
    }

    /// Uses `lines` in place of stdin.
    pub fn with_lines(uri_handler: UriHandler, lines: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            uri_handler,
            lines: Arc::new(Mutex::new(lines)),
        }
    }
}

fn forward_lines(reader: impl BufRead, tx: mpsc::UnboundedSender<String>) {
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if tx.send(line).is_err() {
            break;
        }
    }
}

/// Hands a pasted callback URL to the waiting flow.
fn deliver_pasted(uri_handler: &UriHandler, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match Url::parse(line) {
        Ok(uri) => {
            if uri_handler.deliver(uri) == 0 {
                warn!("pasted URL arrived with no sign-in waiting");
            }
        }
        Err(e) => eprintln!("That does not look like a URL ({}). Paste the full address.", e),
    }
}

/// Reads a yes/no answer; `interrupt` resolving with `Ok` counts as no.
async fn read_answer(
    lines: &mut mpsc::UnboundedReceiver<String>,
    interrupt: impl Future<Output = std::io::Result<()>>,
) -> bool {
    tokio::select! {
        answer = lines.recv() => answer.as_deref().is_some_and(is_yes),
        Ok(()) = interrupt => {
            eprintln!();
            false
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "" | "y" | "yes")
}

impl LoginUi for TerminalUi {
    fn progress(&self, flow: &str, cancel: CancellationToken) -> ProgressGuard {
        eprintln!("Waiting for sign-in ({})...", flow);
        eprintln!("If the browser shows a page with a URL to copy, paste it here.");
        eprintln!("Press Ctrl+C to cancel.");

        let done = CancellationToken::new();
        let task_done = done.clone();
        let lines = self.lines.clone();
        let uri_handler = self.uri_handler.clone();

        tokio::spawn(async move {
            let mut lines = lines.lock().await;
            loop {
                tokio::select! {
                    biased;
                    _ = task_done.cancelled() => break,
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("Cancelling sign-in...");
                        cancel.cancel();
                        break;
                    }
                    line = lines.recv() => match line {
                        Some(line) => deliver_pasted(&uri_handler, &line),
                        None => {
                            // stdin closed
                            task_done.cancelled().await;
                            break;
                        }
                    },
                }
            }
            debug!("progress prompt finished");
        });

        ProgressGuard::new(move || done.cancel())
    }

    fn confirm_fallback<'a>(&'a self, next_flow: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            eprint!("Sign-in did not complete. Try {} instead? [Y/n] ", next_flow);
            let mut lines = self.lines.lock().await;
            // The progress scope took over SIGINT, so Ctrl+C here declines.
            read_answer(&mut lines, tokio::signal::ctrl_c()).await
        })
    }

    fn notify_error(&self, message: &str) {
        eprintln!("warning: {}", message);
    }
}

/// Prints assignment warnings to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn warn(&self, message: &str) {
        eprintln!("warning: {}", message);
    }
}
