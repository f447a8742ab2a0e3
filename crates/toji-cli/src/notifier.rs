use toji_core::auth::TracingNotifier;
use toji_core::{Notice, Notifier};

/// Prints session notices on their own line in the terminal
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notice: Notice) {
        TracingNotifier.notify(notice);
        // Start on a fresh line; the countdown redraws in place with '\r'
        eprintln!("\n{}", notice);
    }
}
