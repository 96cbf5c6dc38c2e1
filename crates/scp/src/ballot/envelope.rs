use lumen_common::NodeId;

use super::{BallotPhase, BallotProtocol};
use crate::driver::ScpDriver;
use crate::quorum::hash_quorum_set;
use crate::types::{
    Ballot, ConfirmStatement, Envelope, ExternalizeStatement, Pledges, PrepareStatement,
    Statement, Value,
};
use crate::SlotContext;

impl BallotProtocol {
    /// Hand the latest local envelope to the driver, once, and only from the
    /// outermost processing level.
    pub(super) fn send_latest_envelope<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) {
        if self.message_level != 0 || !self.fully_validated {
            return;
        }
        let Some(envelope) = self.last_envelope.as_ref() else {
            return;
        };
        if self.last_envelope_emit.as_ref() == Some(envelope) {
            return;
        }
        self.last_envelope_emit = Some(envelope.clone());
        ctx.driver.emit_envelope(envelope);
    }

    /// Record the statement for the current phase and feed it back into
    /// the state machine, so cascading transitions complete within one call.
    pub(super) fn emit_current_state<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) {
        let statement = match self.phase {
            BallotPhase::Prepare => self.emit_prepare(ctx),
            BallotPhase::Confirm => self.emit_confirm(ctx),
            BallotPhase::Externalize => self.emit_externalize(ctx),
        };
        if let Some(statement) = statement {
            self.advance_slot(&statement, ctx);
        }
        self.send_latest_envelope(ctx);
    }

    /// A zero ballot is recorded before the first bump so the local node
    /// counts in quorum checks, but it is never sent.
    fn emit_prepare<D: ScpDriver>(&mut self, ctx: &SlotContext<'_, D>) -> Option<Statement> {
        let can_emit = self.current_ballot.is_some();
        let ballot = self
            .current_ballot
            .clone()
            .unwrap_or_else(|| Ballot::new(0, Value::default()));
        let pledges = Pledges::Prepare(PrepareStatement {
            quorum_set_hash: hash_quorum_set(ctx.local_quorum_set),
            ballot,
            prepared: self.prepared.clone(),
            prepared_prime: self.prepared_prime.clone(),
            n_c: counter_of(&self.commit),
            n_h: counter_of(&self.high_ballot),
        });
        self.record_statement(pledges, can_emit, ctx)
    }

    fn emit_confirm<D: ScpDriver>(&mut self, ctx: &SlotContext<'_, D>) -> Option<Statement> {
        let ballot = self.current_ballot.clone()?;
        let pledges = Pledges::Confirm(ConfirmStatement {
            ballot,
            n_prepared: counter_of(&self.prepared),
            n_commit: counter_of(&self.commit),
            n_h: counter_of(&self.high_ballot),
            quorum_set_hash: hash_quorum_set(ctx.local_quorum_set),
        });
        self.record_statement(pledges, true, ctx)
    }

    fn emit_externalize<D: ScpDriver>(&mut self, ctx: &SlotContext<'_, D>) -> Option<Statement> {
        let commit = self.commit.clone()?;
        let pledges = Pledges::Externalize(ExternalizeStatement {
            commit,
            n_h: counter_of(&self.high_ballot),
            commit_quorum_set_hash: hash_quorum_set(ctx.local_quorum_set),
        });
        self.record_statement(pledges, true, ctx)
    }

    fn record_statement<D: ScpDriver>(
        &mut self,
        pledges: Pledges,
        set_last: bool,
        ctx: &SlotContext<'_, D>,
    ) -> Option<Statement> {
        let statement = Statement {
            node_id: *ctx.local_node_id,
            slot_index: ctx.slot_index,
            pledges,
        };
        let envelope = Envelope::new(statement.clone());
        if !self.record_local_envelope(ctx.local_node_id, envelope.clone()) {
            return None;
        }
        if set_last {
            self.last_envelope = Some(envelope);
        }
        Some(statement)
    }

    fn record_local_envelope(&mut self, local_node_id: &NodeId, envelope: Envelope) -> bool {
        if !self.is_newer_statement(local_node_id, &envelope.statement) {
            return false;
        }
        self.latest_envelopes.insert(*local_node_id, envelope);
        true
    }
}

fn counter_of(ballot: &Option<Ballot>) -> u32 {
    ballot.as_ref().map(|b| b.counter).unwrap_or(0)
}
