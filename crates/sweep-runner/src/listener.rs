use std::io::{self, BufRead};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::signal::Coordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    SaveRequested,
    InputClosed,
    SuccessAlreadyFound,
}

/// Watches `input` for a line equal to `token` (trimmed, case-insensitive)
/// and raises the save request. Runs until it fires, input closes, or a
/// success has already been recorded.
pub fn spawn_listener<R>(
    input: R,
    token: &str,
    coordinator: Coordinator,
) -> io::Result<JoinHandle<ListenerExit>>
where
    R: BufRead + Send + 'static,
{
    let token = token.trim().to_lowercase();
    thread::Builder::new()
        .name("command-listener".to_string())
        .spawn(move || listen(input, &token, &coordinator))
}

pub(crate) fn listen<R: BufRead>(mut input: R, token: &str, coordinator: &Coordinator) -> ListenerExit {
    let mut line = String::new();
    loop {
        if coordinator.success_found() {
            return ListenerExit::SuccessAlreadyFound;
        }
        line.clear();
        match input.read_line(&mut line) {
            Ok(0) => {
                debug!("command input closed");
                return ListenerExit::InputClosed;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "command input unreadable; save requests disabled");
                return ListenerExit::InputClosed;
            }
        }
        if coordinator.success_found() {
            return ListenerExit::SuccessAlreadyFound;
        }
        if line.trim().to_lowercase() == token {
            if coordinator.request_save() {
                info!("save requested; waiting for running jobs to finish");
            }
            return ListenerExit::SaveRequested;
        }
    }
}
