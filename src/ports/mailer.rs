use async_trait::async_trait;
use thiserror::Error;

/// Custom error type for outgoing mail
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MailerError {
    /// The message could not be rendered
    #[error("Render error: {0}")]
    Render(String),

    /// The transport refused or lost the message
    #[error("Delivery to {recipient} failed: {reason}")]
    Delivery { recipient: String, reason: String },
}

pub type MailerResult<T> = Result<T, MailerError>;

/// Data for the message sent right after registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeEmail {
    pub user_id: i64,
    pub name: String,
    pub activation_token: String,
}

impl WelcomeEmail {
    pub fn subject(&self) -> &'static str {
        "Welcome to Cinedex!"
    }

    /// Plain-text body.
    pub fn body(&self) -> String {
        format!(
            "Hi {name},\n\n\
             Thanks for signing up for a Cinedex account. Your user ID number is {id}.\n\n\
             To activate your account, send a `PUT /v1/users/activated` request with the \
             following JSON body:\n\n\
             {{\"token\": \"{token}\"}}\n\n\
             This is a one-time use token and it will expire in 3 days.\n\n\
             Thanks,\n\nThe Cinedex Team\n",
            name = self.name,
            id = self.user_id,
            token = self.activation_token,
        )
    }
}

/// Mailer defines the port for delivering user-facing email
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    /// Deliver the welcome message to `recipient`
    ///
    /// # Arguments
    /// * `recipient` - Destination address
    /// * `email` - The welcome message contents
    async fn send_welcome(&self, recipient: &str, email: &WelcomeEmail) -> MailerResult<()>;
}
