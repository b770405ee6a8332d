//! Dataflow shaping built from `Channel` and `Select`.
//!
//! `fan_out` spreads one stream over two consumers, `fan_in` merges two streams into
//! one, and `turnout` does both while honoring a quit channel. All of them drop a
//! source out of the selection set once it reports closed-and-drained, since a closed
//! receive case is always ready and would otherwise starve the live sources.
use tracing::{debug, warn};

use crate::comms::channel::{Channel, Owner, Pending};
use crate::comms::select::Select;
use crate::CspError;

/// Hands `value` to whichever of `outs` can take it first, blocking until one can.
/// Returns the index of the output used.
pub fn route<T>(value: T, outs: [&Channel<T>; 2]) -> Result<usize, CspError> {
    let pending = Pending::new(value);
    Select::new()
        .send_from(outs[0], &pending, |sent| sent.map(|_| 0))
        .send_from(outs[1], &pending, |sent| sent.map(|_| 1))
        .run()
}

/// Forwards everything from `input` to whichever output is ready, until `input` is
/// closed and drained. Returns how many values were forwarded.
pub fn fan_out<T>(input: &Channel<T>, outs: [&Channel<T>; 2]) -> Result<usize, CspError> {
    let mut forwarded = 0;
    while let Some(value) = input.receive() {
        route(value, outs)?;
        forwarded += 1;
    }
    debug!(forwarded, "fan-out input drained");
    Ok(forwarded)
}

/// Merges `inputs` into `out` until every input is closed and drained.
pub fn fan_in<T>(inputs: [&Channel<T>; 2], out: &Channel<T>) -> Result<usize, CspError> {
    let mut live: Vec<&Channel<T>> = inputs.to_vec();
    let mut forwarded = 0;
    while !live.is_empty() {
        let mut select = Select::new();
        for (slot, input) in live.iter().enumerate() {
            select = select.recv(*input, move |value| (slot, value));
        }
        match select.run() {
            (_, Some(value)) => {
                out.send(value)?;
                forwarded += 1;
            }
            (slot, None) => {
                live.swap_remove(slot);
            }
        }
    }
    debug!(forwarded, "fan-in inputs drained");
    Ok(forwarded)
}

/// What a `turnout` moved before returning.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TurnoutReport {
    /// Values routed while the turnout was running.
    pub forwarded: usize,
    /// Values left buffered in the sources at quit time, routed during shutdown.
    pub drained: usize,
}

enum Event<T> {
    Quit,
    Value(T),
    Exhausted(usize),
}

/// Why the merge loop of a turnout stopped.
#[derive(Debug, PartialEq, Eq)]
enum Ending {
    Quit,
    Exhausted,
}

/// Merges the owned `sources` and routes each value to a ready output, until `quit`
/// fires or every source has been closed and drained.
///
/// However the merge ends, on quit or on a failed route, the turnout as owner closes
/// every source before doing anything else, so producers blocked on a source are
/// released. It then routes whatever the sources still buffer and returns the first
/// error, if any. A value or a close on `quit` both count as the signal.
pub fn turnout<T>(
    quit: &Channel<()>,
    sources: Vec<Owner<T>>,
    outs: [&Channel<T>; 2],
) -> Result<TurnoutReport, CspError> {
    let mut report = TurnoutReport::default();
    let handles: Vec<Channel<T>> = sources.iter().map(Owner::handle).collect();
    let merged = merge(quit, &handles, outs, &mut report);
    if merged == Ok(Ending::Exhausted) {
        debug!(forwarded = report.forwarded, "turnout sources exhausted");
        return Ok(report);
    }

    debug!(forwarded = report.forwarded, "turnout stopping, closing sources");
    for owner in sources {
        if owner.close().is_err() {
            warn!("turnout source was closed by a party that does not own it");
        }
    }

    let mut failure = merged.err();
    for source in &handles {
        while failure.is_none() {
            let Some(value) = source.receive() else {
                break;
            };
            match route(value, outs) {
                Ok(_) => report.drained += 1,
                Err(err) => failure = Some(err),
            }
        }
    }
    match failure {
        Some(err) => {
            warn!(error = %err, "turnout shut down with undeliverable values");
            Err(err)
        }
        None => {
            debug!(drained = report.drained, "turnout shut down");
            Ok(report)
        }
    }
}

fn merge<T>(
    quit: &Channel<()>,
    sources: &[Channel<T>],
    outs: [&Channel<T>; 2],
    report: &mut TurnoutReport,
) -> Result<Ending, CspError> {
    let mut live: Vec<usize> = (0..sources.len()).collect();
    while !live.is_empty() {
        let mut select = Select::new().recv(quit, |_| Event::Quit);
        for &source in &live {
            select = select.recv(&sources[source], move |value| match value {
                Some(value) => Event::Value(value),
                None => Event::Exhausted(source),
            });
        }
        match select.run() {
            Event::Value(value) => {
                route(value, outs)?;
                report.forwarded += 1;
            }
            Event::Exhausted(source) => {
                debug!(source, "turnout source closed, removing it from selection");
                live.retain(|&other| other != source);
            }
            Event::Quit => return Ok(Ending::Quit),
        }
    }
    Ok(Ending::Exhausted)
}
