//! Per-event orchestration: filter, associate, claim, quota, write, reply.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use beerbot_config::AppConfig;
use beerbot_core::{
    Delivery, GiftAssociator, InboundEvent, InboundMessage, MetricsSink, Outbound, Outcome,
    SlashCommand,
};
use beerbot_ledger::{GiftBatch, LedgerError, LedgerStore, Settlement};

use crate::stats::{self, StatsRequest};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const INVALID_RECIPIENT_NOTICE: &str = "⚠️ Could not find a valid recipient in your beer message.";
const SELF_GIFT_NOTICE: &str = "🍺 You can't gift beer to yourself. Find a teammate!";
const UNSUPPORTED_COMMAND_NOTICE: &str = "Unsupported command.";
const STATS_FAILED_NOTICE: &str = "Error generating stats.";

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// The only channel whose messages are parsed for gifts.
    pub channel: String,
    pub max_per_day: u64,
    pub stats_command: String,
    /// Claim and confirm gifts without writing them.
    pub read_only: bool,
}

impl ProcessorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            channel: config.slack.channel.clone(),
            max_per_day: config.quota.max_per_day,
            stats_command: config.slack.stats_command.clone(),
            read_only: config.ledger.read_only,
        }
    }
}

/// Whether the transport may consider a delivery handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledge,
    /// Nothing was committed; leave the delivery unacknowledged so it comes back.
    Redeliver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Message { channel: String, text: String },
    Ephemeral { channel: String, user: String, text: String },
}

/// The ledger's verdict on one delivery and the replies it calls for. The
/// replies are posted after the transport has been told the disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub disposition: Disposition,
    pub replies: Vec<Reply>,
}

impl Decision {
    fn acknowledge(replies: Vec<Reply>) -> Self {
        Self {
            disposition: Disposition::Acknowledge,
            replies,
        }
    }
}

pub struct EventProcessor {
    ledger: LedgerStore,
    associator: GiftAssociator,
    outbound: Arc<dyn Outbound>,
    metrics: Arc<dyn MetricsSink>,
    settings: ProcessorSettings,
    clock: Clock,
}

impl EventProcessor {
    pub fn new(
        ledger: LedgerStore,
        associator: GiftAssociator,
        outbound: Arc<dyn Outbound>,
        metrics: Arc<dyn MetricsSink>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            ledger,
            associator,
            outbound,
            metrics,
            settings,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock used for "today" and marker timestamps.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Decide and reply in one go.
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        let decision = self.decide(delivery).await;
        self.post_replies(decision.replies).await;
        decision.disposition
    }

    /// Settle the delivery against the ledger without posting anything.
    pub async fn decide(&self, delivery: Delivery) -> Decision {
        match delivery.event {
            InboundEvent::Message(msg) => {
                let (outcome, replies) = self.settle_message(delivery.envelope_id.as_deref(), &msg).await;
                let disposition = match outcome {
                    Outcome::StorageError => Disposition::Redeliver,
                    _ => Disposition::Acknowledge,
                };
                Decision {
                    disposition,
                    replies,
                }
            }
            InboundEvent::SlashCommand(cmd) => {
                Decision::acknowledge(vec![self.answer_slash_command(&cmd).await])
            }
            InboundEvent::Other(kind) => {
                debug!(%kind, "ignoring non-message event");
                Decision::acknowledge(Vec::new())
            }
        }
    }

    pub async fn process_message(&self, envelope_id: Option<&str>, msg: &InboundMessage) -> Outcome {
        let (outcome, replies) = self.settle_message(envelope_id, msg).await;
        self.post_replies(replies).await;
        outcome
    }

    async fn settle_message(&self, envelope_id: Option<&str>, msg: &InboundMessage) -> (Outcome, Vec<Reply>) {
        let mut replies = Vec::new();
        let outcome = self.evaluate(envelope_id, msg, &mut replies).await;
        self.metrics.record_outcome(outcome);
        (outcome, replies)
    }

    async fn evaluate(
        &self,
        envelope_id: Option<&str>,
        msg: &InboundMessage,
        replies: &mut Vec<Reply>,
    ) -> Outcome {
        if let Some(reason) = self.skip_reason(msg) {
            debug!(reason, channel = %msg.channel, ts = %msg.ts, "message skipped");
            return Outcome::Ignored;
        }
        if !self.associator.has_markers(&msg.text) {
            return Outcome::Ignored;
        }

        let key = envelope_id
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| msg.synthetic_key());
        let now = (self.clock)();
        let gifts = self.associator.associate(&msg.text);

        let rejection = if gifts.is_empty() {
            Some((INVALID_RECIPIENT_NOTICE, Outcome::InvalidRecipient))
        } else if gifts.contains_key(&msg.sender) {
            Some((SELF_GIFT_NOTICE, Outcome::SelfGift))
        } else {
            None
        };
        if let Some((notice, outcome)) = rejection {
            let outcome = self.claim_rejected(key, now, msg, outcome).await;
            if matches!(outcome, Outcome::InvalidRecipient | Outcome::SelfGift) {
                replies.push(Reply::Ephemeral {
                    channel: msg.channel.clone(),
                    user: msg.sender.clone(),
                    text: notice.to_string(),
                });
            }
            return outcome;
        }

        let batch = match GiftBatch::new(key, &msg.sender, &msg.ts, gifts, now) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, channel = %msg.channel, "gift message cannot be settled");
                return Outcome::Ignored;
            }
        };
        let gifts = batch.gifts.clone();
        let ledger = self.ledger.clone();
        let today = now.date_naive();
        let max_per_day = self.settings.max_per_day;
        let read_only = self.settings.read_only;
        let settled = run_blocking(move || {
            if read_only {
                ledger.settle_read_only(&batch, today, max_per_day)
            } else {
                ledger.settle(&batch, today, max_per_day)
            }
        })
        .await;

        let confirm = |replies: &mut Vec<Reply>| {
            for (recipient, &quantity) in &gifts {
                replies.push(Reply::Message {
                    channel: msg.channel.clone(),
                    text: confirmation(&msg.sender, recipient, quantity),
                });
            }
        };

        match settled {
            Ok(Settlement::Duplicate) => {
                debug!(giver = %msg.sender, ts = %msg.ts, "duplicate delivery dropped");
                Outcome::Duplicate
            }
            Ok(Settlement::Rejected(decision)) => {
                info!(giver = %msg.sender, ?decision, "gift rejected by daily quota");
                if let Some(text) = decision.rejection_notice(&msg.sender) {
                    replies.push(Reply::Message {
                        channel: msg.channel.clone(),
                        text,
                    });
                }
                Outcome::QuotaRejected
            }
            Ok(Settlement::Recorded { units, given_today }) => {
                info!(
                    giver = %msg.sender,
                    recipients = gifts.len(),
                    units,
                    given_today,
                    "gift recorded"
                );
                confirm(replies);
                Outcome::Recorded
            }
            Ok(Settlement::Admitted { units, given_today }) => {
                info!(
                    giver = %msg.sender,
                    recipients = gifts.len(),
                    units,
                    given_today,
                    mode = "read-only",
                    "gift admitted, ledger write skipped"
                );
                confirm(replies);
                Outcome::Recorded
            }
            Err(err) => {
                log_storage_failure(&err, "settling gift batch");
                Outcome::StorageError
            }
        }
    }

    fn skip_reason(&self, msg: &InboundMessage) -> Option<&'static str> {
        if msg.channel != self.settings.channel {
            Some("other channel")
        } else if msg.sender.is_empty() {
            Some("no sender")
        } else if msg.bot_id.is_some() {
            Some("bot message")
        } else if msg.subtype.is_some() {
            Some("subtyped message")
        } else if msg.is_thread_reply() {
            Some("thread reply")
        } else if msg.text.trim().is_empty() {
            Some("empty text")
        } else {
            None
        }
    }

    /// Claim a message that records nothing. Returns `outcome` when this
    /// call made the claim.
    async fn claim_rejected(
        &self,
        key: String,
        now: DateTime<Utc>,
        msg: &InboundMessage,
        outcome: Outcome,
    ) -> Outcome {
        let ledger = self.ledger.clone();
        match run_blocking(move || ledger.try_claim(&key, now)).await {
            Ok(true) => {
                info!(giver = %msg.sender, ?outcome, "gift message rejected");
                outcome
            }
            Ok(false) => Outcome::Duplicate,
            Err(err) => {
                log_storage_failure(&err, "claiming rejected message");
                Outcome::StorageError
            }
        }
    }

    async fn answer_slash_command(&self, cmd: &SlashCommand) -> Reply {
        let reply = |text: String| Reply::Ephemeral {
            channel: cmd.channel.clone(),
            user: cmd.user.clone(),
            text,
        };
        if cmd.command != self.settings.stats_command {
            return reply(UNSUPPORTED_COMMAND_NOTICE.to_string());
        }

        let request = StatsRequest::parse(&cmd.text);
        let (start, end) = request.window((self.clock)().date_naive());
        let ledger = self.ledger.clone();
        let limit = request.limit;
        let ranked = run_blocking(move || {
            let givers = ledger.top_givers(start, end, limit)?;
            let receivers = ledger.top_receivers(start, end, limit)?;
            Ok((givers, receivers))
        })
        .await;

        match ranked {
            Ok((givers, receivers)) => reply(stats::render(&request, &givers, &receivers)),
            Err(err) => {
                log_storage_failure(&err, "building stats");
                reply(STATS_FAILED_NOTICE.to_string())
            }
        }
    }

    /// Post replies in order. Failures are logged and skipped.
    pub async fn post_replies(&self, replies: Vec<Reply>) {
        for reply in replies {
            match reply {
                Reply::Message { channel, text } => self.post_message(&channel, &text).await,
                Reply::Ephemeral { channel, user, text } => {
                    self.post_ephemeral(&channel, &user, &text).await
                }
            }
        }
    }

    async fn post_message(&self, channel: &str, text: &str) {
        if let Err(err) = self.outbound.post_message(channel, text).await {
            warn!(error = %err, %channel, "failed to post reply");
        }
    }

    async fn post_ephemeral(&self, channel: &str, user: &str, text: &str) {
        if channel.is_empty() || user.is_empty() {
            return;
        }
        if let Err(err) = self.outbound.post_ephemeral(channel, user, text).await {
            warn!(error = %err, %channel, %user, "failed to post ephemeral notice");
        }
    }
}

pub(crate) fn confirmation(giver: &str, recipient: &str, quantity: u32) -> String {
    let (glyph, plural) = if quantity == 1 { ("🍺", "") } else { ("🍻", "s") };
    format!("{glyph} <@{giver}> gave {quantity} beer{plural} to <@{recipient}>!")
}

/// Run a ledger call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(call).await??)
}

fn log_storage_failure(err: &anyhow::Error, action: &str) {
    let transient = err
        .downcast_ref::<LedgerError>()
        .is_none_or(LedgerError::is_transient);
    if transient {
        warn!(error = %err, action, "transient storage failure; event left unclaimed");
    } else {
        error!(error = %err, action, "storage failure; event left unclaimed");
    }
}
