//! Shared fixtures for the integration suites.

mod cluster;
mod probe;
mod reporter;

pub(crate) use self::cluster::{Cluster, Gate, ProbeFactory, RawWorker, TOKEN, steady_probes};
pub(crate) use self::probe::ScriptedProbe;
pub(crate) use self::reporter::{HealthEvent, RecordingHealthReporter};

use std::sync::mpsc::{self, Receiver, Sender};

use crate::operation::{NotifyTarget, Operation, OperationError};

pub(crate) type Delivered<O> = Result<<O as Operation>::Output, OperationError>;

/// Forwards every outcome to a channel.
pub(crate) struct ChannelTarget<O: Operation> {
    sender: Sender<Delivered<O>>,
}

impl<O: Operation> NotifyTarget<O> for ChannelTarget<O> {
    fn on_complete(self: Box<Self>, _operation: O, output: O::Output) {
        // The receiving test may already have finished.
        drop(self.sender.send(Ok(output)));
    }

    fn on_failure(self: Box<Self>, _operation: O, error: OperationError) {
        drop(self.sender.send(Err(error)));
    }
}

pub(crate) fn channel_target<O: Operation>() -> (Box<dyn NotifyTarget<O>>, Receiver<Delivered<O>>) {
    let (sender, receiver) = mpsc::channel();
    (Box::new(ChannelTarget { sender }), receiver)
}
