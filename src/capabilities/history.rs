use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

use crate::model::{HistoryRecord, UnixTimeMs};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum HistoryOperation {
    Save(HistoryRecord),
}

/// Outcome of a save. The error is the store's message; the core only shows it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistorySaveOutcome {
    pub result: Result<(), String>,
    pub at: UnixTimeMs,
}

impl Operation for HistoryOperation {
    type Output = HistorySaveOutcome;
}

/// Persists finished walks through the shell's document store.
pub struct History<Ev> {
    context: CapabilityContext<HistoryOperation, Ev>,
}

impl<Ev> Capability<Ev> for History<Ev> {
    type Operation = HistoryOperation;
    type MappedSelf<MappedEv> = History<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        History::new(self.context.map_event(f))
    }
}

impl<Ev> History<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<HistoryOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn save<F>(&self, record: HistoryRecord, callback: F)
    where
        F: FnOnce(HistorySaveOutcome) -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let outcome = context
                .request_from_shell(HistoryOperation::Save(record))
                .await;
            context.update_app(callback(outcome));
        });
    }
}
