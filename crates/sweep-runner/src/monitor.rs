use std::io::{self, BufRead, BufReader, Read};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};

use crate::signal::Coordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Matched,
    AlreadySignalled,
    StreamClosed,
    ReadError,
}

/// Scans `stream` line by line for `marker` on a dedicated thread.
///
/// The monitor only writes the success signal and wakes the scheduler; it
/// never waits on or touches the job's process.
pub fn spawn_monitor<R>(
    index: u64,
    candidate: &str,
    stream: R,
    marker: String,
    coordinator: Coordinator,
) -> io::Result<JoinHandle<MonitorExit>>
where
    R: Read + Send + 'static,
{
    let label = candidate.to_string();
    thread::Builder::new()
        .name(format!("monitor-{}", index))
        .spawn(move || {
            let exit = scan_stream(index, &label, stream, &marker, &coordinator);
            debug!(index, candidate = %label, ?exit, "monitor finished");
            coordinator.wake();
            exit
        })
}

pub(crate) fn scan_stream<R: Read>(
    index: u64,
    candidate: &str,
    stream: R,
    marker: &str,
    coordinator: &Coordinator,
) -> MonitorExit {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        if coordinator.success_found() {
            return MonitorExit::AlreadySignalled;
        }
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return MonitorExit::StreamClosed,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(index, candidate, error = %e, "output stream read failed");
                return MonitorExit::ReadError;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        trace!(index, candidate, line, "tool output");
        if line.contains(marker) {
            if coordinator.record_success(index, line) {
                info!(index, candidate, line, "success marker found");
                return MonitorExit::Matched;
            }
            return MonitorExit::AlreadySignalled;
        }
    }
}
