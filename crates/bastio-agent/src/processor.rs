//! # Action Processor
//!
//! Consumes action messages from its ingress queue, applies them to the
//! local system through [`AccountManager`], and emits exactly one feedback
//! (echoing the request `mid`) on its egress queue for every input.
//!
//! The processor runs as a single infinite task, so local mutations are
//! serialized; there is no parallel provisioning.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use bastio_proto::{ActionKind, ActionMessage, FeedbackMessage, ProtocolMessage};

use crate::accounts::AccountManager;
use crate::connector::EndpointHandle;
use crate::error::AgentResult;
use crate::pool::{Pool, Task, TaskHandle};

/// How long one handler pass waits for an ingress message before yielding
/// back to the pool.
const INGRESS_POLL_TIMEOUT: Duration = Duration::from_secs(3);

/// The agent-side consumer of backend action messages.
pub struct Processor {
    inner: Arc<ProcessorInner>,
    handle: Mutex<Option<TaskHandle>>,
}

struct ProcessorInner {
    accounts: AccountManager,
    ingress_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ProtocolMessage>>,
    egress_tx: mpsc::UnboundedSender<ProtocolMessage>,
}

impl Processor {
    /// Create a processor and the endpoint to register with the connector.
    pub fn new(accounts: AccountManager) -> (Self, EndpointHandle) {
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();
        let processor = Self {
            inner: Arc::new(ProcessorInner {
                accounts,
                ingress_rx: tokio::sync::Mutex::new(ingress_rx),
                egress_tx,
            }),
            handle: Mutex::new(None),
        };
        let endpoint = EndpointHandle {
            ingress: ingress_tx,
            egress: egress_rx,
        };
        (processor, endpoint)
    }

    /// Submit the action-handler task to the pool. Idempotent.
    pub fn start(&self, pool: &Pool) {
        let mut guard = self.handle.lock().expect("processor handle");
        if guard.is_some() {
            return;
        }
        info!("action handler started");
        let inner = self.inner.clone();
        let task = Task::new(move |token| {
            let inner = inner.clone();
            async move { inner.run_once(token).await }.boxed()
        })
        .infinite()
        .on_failure(|failure| {
            error!(
                task_id = %failure.task_id,
                error = %failure.error,
                "unexpected error occurred in the action handler"
            );
        });
        *guard = Some(pool.run(task));
    }

    /// Signal the action handler to stop.
    pub fn stop(&self) {
        if let Some(handle) = &*self.handle.lock().expect("processor handle") {
            handle.stop();
        }
    }

    /// Process one action message and produce its feedback. Exposed so the
    /// provisioning scenarios can be driven without a running pool.
    pub async fn process(&self, action: &ActionMessage) -> FeedbackMessage {
        self.inner.process(action).await
    }
}

impl ProcessorInner {
    /// One handler pass: wait briefly for a message, apply it, reply.
    async fn run_once(&self, token: CancellationToken) -> AgentResult<()> {
        let received = {
            let mut rx = self.ingress_rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(INGRESS_POLL_TIMEOUT) => return Ok(()),
                message = rx.recv() => message,
            }
        };
        let Some(message) = received else {
            // Every ingress sender is gone; idle until stopped.
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(INGRESS_POLL_TIMEOUT) => {}
            }
            return Ok(());
        };

        match message {
            ProtocolMessage::Action(action) => {
                debug!(
                    action = action.kind.name(),
                    username = %action.username,
                    mid = %action.mid,
                    "processing action"
                );
                let feedback = self.process(&action).await;
                let _ = self.egress_tx.send(ProtocolMessage::Feedback(feedback));
            }
            ProtocolMessage::Feedback(feedback) => {
                // The agent originates no requests, so feedback has nowhere
                // to go; drop it loudly enough to notice.
                debug!(mid = %feedback.mid, "ignoring feedback message from the backend");
            }
        }
        Ok(())
    }

    async fn process(&self, action: &ActionMessage) -> FeedbackMessage {
        let outcome = match &action.kind {
            ActionKind::AddUser { sudo } => self.accounts.add_user(&action.username, *sudo).await,
            ActionKind::RemoveUser => self.accounts.remove_user(&action.username).await,
            ActionKind::UpdateUser { sudo } => {
                self.accounts.update_user(&action.username, *sudo).await
            }
            ActionKind::AddKey { public_key } => {
                self.accounts.add_key(&action.username, public_key).await
            }
            ActionKind::RemoveKey { public_key } => {
                self.accounts.remove_key(&action.username, public_key).await
            }
        };
        action.reply(outcome.detail, outcome.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastio_proto::FeedbackStatus;

    const TEST_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAAAgQCxyzzyqwer/tyuiop+asdf tester";

    #[tokio::test]
    async fn test_update_user_missing_replies_error_with_same_mid() {
        let (processor, _endpoint) = Processor::new(AccountManager::new());
        let action =
            ActionMessage::new("bastio_missing_user", ActionKind::UpdateUser { sudo: false })
                .unwrap();
        let feedback = processor.process(&action).await;
        assert_eq!(feedback.mid, action.mid);
        assert_eq!(feedback.status, FeedbackStatus::Error);
        assert!(feedback.feedback.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_every_action_kind_produces_matching_mid() {
        let (processor, _endpoint) = Processor::new(AccountManager::new());
        let kinds = [
            ActionKind::AddUser { sudo: false },
            ActionKind::RemoveUser,
            ActionKind::UpdateUser { sudo: true },
            ActionKind::AddKey {
                public_key: TEST_KEY.to_string(),
            },
            ActionKind::RemoveKey {
                public_key: TEST_KEY.to_string(),
            },
        ];
        for kind in kinds {
            let action = ActionMessage::new("bastio_missing_user", kind).unwrap();
            let feedback = processor.process(&action).await;
            assert_eq!(feedback.mid, action.mid, "mid must be echoed");
        }
    }

    #[tokio::test]
    async fn test_handler_replies_through_endpoint() {
        let pool = Pool::new(2);
        let (processor, mut endpoint) = Processor::new(AccountManager::new());
        processor.start(&pool);

        let action =
            ActionMessage::new("bastio_missing_user", ActionKind::UpdateUser { sudo: false })
                .unwrap();
        let mid = action.mid.clone();
        endpoint
            .ingress
            .send(ProtocolMessage::Action(action))
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), endpoint.egress.recv())
            .await
            .expect("feedback within the timeout")
            .expect("egress open");
        let ProtocolMessage::Feedback(feedback) = reply else {
            panic!("expected feedback on egress");
        };
        assert_eq!(feedback.mid, mid);
        assert_eq!(feedback.status, FeedbackStatus::Error);

        processor.stop();
        pool.remove_all_workers(Some(Duration::from_secs(2))).await;
    }

    #[tokio::test]
    async fn test_feedback_on_ingress_is_dropped() {
        let pool = Pool::new(2);
        let (processor, mut endpoint) = Processor::new(AccountManager::new());
        processor.start(&pool);

        endpoint
            .ingress
            .send(ProtocolMessage::Feedback(FeedbackMessage::new(
                "stray",
                FeedbackStatus::Info,
            )))
            .unwrap();

        // No feedback is produced for feedback.
        let reply = tokio::time::timeout(Duration::from_millis(500), endpoint.egress.recv()).await;
        assert!(reply.is_err(), "feedback input must not produce output");

        processor.stop();
        pool.remove_all_workers(Some(Duration::from_secs(2))).await;
    }
}
