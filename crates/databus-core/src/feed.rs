//! Change-feed intake.
//!
//! The data store's change feed hands each committed mutation to a
//! [`MutationSink`]. The sink only queues; a drain task applies mutations
//! to the bus in arrival order, so the writer's commit path never waits on
//! bus storage.

use databus_types::Mutation;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::Databus;

/// Non-blocking entry point for committed mutations.
#[derive(Debug, Clone)]
pub struct MutationSink {
    tx: mpsc::UnboundedSender<Mutation>,
}

impl MutationSink {
    /// Queues a mutation for fan-out.
    ///
    /// Returns `false` if the intake has shut down and the mutation was
    /// dropped.
    pub fn on_mutation(&self, table: &str, key: &str, tags: Vec<String>) -> bool {
        self.send(Mutation::new(table, key, tags))
    }

    pub fn send(&self, mutation: Mutation) -> bool {
        match self.tx.send(mutation) {
            Ok(()) => true,
            Err(mpsc::error::SendError(dropped)) => {
                tracing::warn!(
                    table = %dropped.table,
                    key = %dropped.key,
                    "mutation intake closed, dropping mutation"
                );
                false
            }
        }
    }
}

/// Starts the drain task. It runs until every [`MutationSink`] clone is
/// dropped.
///
/// A busy database is retried by [`Databus::apply_mutation`] within the
/// bus retry budget. A mutation that still fails after that is logged and
/// dropped; the drain moves on to the next one.
pub fn start_intake(bus: Databus) -> (MutationSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Mutation>();

    let handle = tokio::spawn(async move {
        while let Some(mutation) = rx.recv().await {
            let (table, key) = (mutation.table.clone(), mutation.key.clone());
            match bus.apply_mutation(mutation).await {
                Ok(delivered) => {
                    tracing::trace!(%table, %key, subscriptions = delivered.len(), "mutation applied");
                }
                Err(e) => {
                    tracing::error!(%table, %key, error = %e, "failed to apply mutation");
                }
            }
        }
        tracing::info!("mutation intake stopped");
    });

    (MutationSink { tx }, handle)
}
