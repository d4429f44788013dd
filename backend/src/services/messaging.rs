use crate::config::{SmsConfig, SmtpConfig};
use crate::workflows::collaborators::{
    Channel, CollaboratorError, DeliveryStatus, MessagingSender, OutboundMessage,
};
use async_trait::async_trait;
use lettre::{
    message::Mailbox,
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info, warn};

/// Messaging backend for workflow send_email / send_sms / send_form steps.
/// Email goes out over SMTP; sms and form links go through the provider's
/// HTTP API when one is configured.
pub struct MessagingService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
    sms: Option<SmsProvider>,
    form_base_url: String,
}

struct SmsProvider {
    client: reqwest::Client,
    config: SmsConfig,
}

impl MessagingService {
    pub fn new(
        smtp: &SmtpConfig,
        sms: Option<SmsConfig>,
        form_base_url: String,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let creds = Credentials::new(smtp.username.clone(), smtp.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(smtp.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        let sms = match sms {
            Some(config) => Some(SmsProvider {
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()?,
                config,
            }),
            None => None,
        };

        Ok(MessagingService {
            transport,
            from_email: smtp.from_email.clone(),
            from_name: smtp.from_name.clone(),
            sms,
            form_base_url,
        })
    }

    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<DeliveryStatus, CollaboratorError> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| CollaboratorError::Provider(format!("bad from address: {}", e)))?;
        let to_mailbox = to
            .parse::<Mailbox>()
            .map_err(|e| CollaboratorError::Provider(format!("bad recipient '{}': {}", to, e)))?;

        let message = Message::builder()
            .from(from)
            .to(to_mailbox)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| CollaboratorError::Provider(e.to_string()))?;

        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent to {}", to);
                Ok(DeliveryStatus::Sent)
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", to, e);
                Err(CollaboratorError::Provider(e.to_string()))
            }
        }
    }

    async fn send_sms(
        &self,
        to: &str,
        body: &str,
        idempotency_key: &str,
    ) -> Result<DeliveryStatus, CollaboratorError> {
        let provider = self.sms.as_ref().ok_or_else(|| {
            CollaboratorError::Provider("no SMS provider configured".to_string())
        })?;

        let response = provider
            .client
            .post(&provider.config.api_url)
            .bearer_auth(&provider.config.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "from": provider.config.from_number,
                "to": to,
                "body": body,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CollaboratorError::Timeout(Duration::from_secs(10))
                } else {
                    CollaboratorError::Provider(e.to_string())
                }
            })?;

        if response.status().is_success() {
            info!("SMS queued for {}", to);
            Ok(DeliveryStatus::Queued)
        } else {
            warn!("SMS provider rejected message to {}: {}", to, response.status());
            Ok(DeliveryStatus::Rejected)
        }
    }
}

#[async_trait]
impl MessagingSender for MessagingService {
    async fn send(
        &self,
        channel: Channel,
        to: &str,
        message: OutboundMessage,
        idempotency_key: &str,
    ) -> Result<DeliveryStatus, CollaboratorError> {
        match channel {
            Channel::Email => {
                self.send_email(
                    to,
                    message.subject.as_deref().unwrap_or(""),
                    &message.body,
                )
                .await
            }
            Channel::Sms => self.send_sms(to, &message.body, idempotency_key).await,
            Channel::Form => {
                // A form step delivers a fill-out link over email.
                let form_id = message
                    .variables
                    .get("form_id")
                    .map(String::as_str)
                    .unwrap_or_default();
                let link = format!("{}/forms/{}", self.form_base_url, form_id);
                self.send_email(to, "Please complete this form", &link).await
            }
        }
    }
}
