use async_trait::async_trait;

use crate::errors::PluginError;
use crate::transfer::Transfer;
use crate::transfer_log::TransferLog;

/// Read-only view handed to the settlement layer. The backend observes the
/// ledger through this context; any mutation it needs goes through its own
/// hooks, never through the transfer log directly.
#[derive(Clone)]
pub struct BackendContext {
    pub prefix: String,
    pub account: String,
    pub peer_account: String,
    log: TransferLog,
}

impl BackendContext {
    pub(crate) fn new(
        prefix: String,
        account: String,
        peer_account: String,
        log: TransferLog,
    ) -> Self {
        BackendContext {
            prefix,
            account,
            peer_account,
            log,
        }
    }

    pub fn balance(&self) -> i64 {
        self.log.balance()
    }

    pub fn outgoing_fulfilled(&self) -> i64 {
        self.log.outgoing_fulfilled()
    }

    pub fn incoming_fulfilled_and_prepared(&self) -> i64 {
        self.log.incoming_fulfilled_and_prepared()
    }

    pub fn outgoing_fulfilled_and_prepared(&self) -> i64 {
        self.log.outgoing_fulfilled_and_prepared()
    }
}

/// Settlement-layer hook points. All methods default to no-ops so a backend
/// only implements the parts of the channel lifecycle it cares about.
#[async_trait]
pub trait PaymentChannelBackend: Send + Sync {
    async fn connect(&self, _ctx: &BackendContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called before an incoming prepare is accepted. Returning an error
    /// cancels the transfer in the log and surfaces the error to the peer.
    async fn handle_incoming_prepare(
        &self,
        _ctx: &BackendContext,
        _transfer: &Transfer,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called after an outgoing transfer is fulfilled. The returned claim (if
    /// any) rides back to the peer as the `claim` sub-protocol of the FULFILL
    /// response.
    async fn create_outgoing_claim(
        &self,
        _ctx: &BackendContext,
        _outgoing_fulfilled: i64,
    ) -> Result<Option<serde_json::Value>, PluginError> {
        Ok(None)
    }

    /// Called with the `claim` sub-protocol extracted from the peer's
    /// response to our FULFILL.
    async fn handle_incoming_claim(
        &self,
        _ctx: &BackendContext,
        _claim: serde_json::Value,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Backend used when no settlement layer is attached.
pub struct NoopBackend;

#[async_trait]
impl PaymentChannelBackend for NoopBackend {}
