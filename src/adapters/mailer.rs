use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;

use crate::ports::mailer::{Mailer, MailerError, MailerResult, WelcomeEmail};

/// A message that was handed to [`LogMailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Number of recent messages [`LogMailer`] keeps.
pub const OUTBOX_CAPACITY: usize = 64;

/// Mailer that writes each message to the log and keeps the most recent ones
/// in memory.
#[derive(Debug)]
pub struct LogMailer {
    sender: String,
    outbox: Mutex<VecDeque<SentMessage>>,
}

impl LogMailer {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            outbox: Mutex::new(VecDeque::with_capacity(OUTBOX_CAPACITY)),
        }
    }

    /// The last [`OUTBOX_CAPACITY`] messages delivered, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send_welcome(&self, recipient: &str, email: &WelcomeEmail) -> MailerResult<()> {
        if recipient.trim().is_empty() {
            return Err(MailerError::Delivery {
                recipient: recipient.to_string(),
                reason: "empty recipient address".to_string(),
            });
        }

        let message = SentMessage {
            sender: self.sender.clone(),
            recipient: recipient.to_string(),
            subject: email.subject().to_string(),
            body: email.body(),
        };

        tracing::info!(
            from = %message.sender,
            to = %message.recipient,
            subject = %message.subject,
            user_id = email.user_id,
            "Sending email"
        );
        tracing::debug!(body = %message.body, "Email body");

        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        if outbox.len() == OUTBOX_CAPACITY {
            outbox.pop_front();
        }
        outbox.push_back(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn welcome_message_carries_activation_token() {
        let mailer = LogMailer::new("Cinedex <no-reply@cinedex.local>");
        let email = WelcomeEmail {
            user_id: 42,
            name: "Faith".to_string(),
            activation_token: "Y3QMGX3PJ3WLRL2YRTQGQ6KRHU".to_string(),
        };

        mailer.send_welcome("faith@example.com", &email).await.unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "faith@example.com");
        assert_eq!(sent[0].subject, "Welcome to Cinedex!");
        assert!(sent[0].body.contains("Y3QMGX3PJ3WLRL2YRTQGQ6KRHU"));
        assert!(sent[0].body.contains("user ID number is 42"));
    }

    #[tokio::test]
    async fn empty_recipient_is_rejected() {
        let mailer = LogMailer::new("no-reply@cinedex.local");
        let email = WelcomeEmail {
            user_id: 1,
            name: "X".to_string(),
            activation_token: "T".to_string(),
        };
        assert!(mailer.send_welcome(" ", &email).await.is_err());
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn outbox_keeps_only_recent_messages() {
        let mailer = LogMailer::new("no-reply@cinedex.local");
        for id in 0..(OUTBOX_CAPACITY as i64 + 10) {
            let email = WelcomeEmail {
                user_id: id,
                name: "Reel".to_string(),
                activation_token: "T".to_string(),
            };
            mailer
                .send_welcome(&format!("user{id}@example.com"), &email)
                .await
                .unwrap();
        }

        let sent = mailer.sent();
        assert_eq!(sent.len(), OUTBOX_CAPACITY);
        assert_eq!(sent[0].recipient, "user10@example.com");
        assert_eq!(
            sent.last().unwrap().recipient,
            format!("user{}@example.com", OUTBOX_CAPACITY + 9)
        );
    }
}
