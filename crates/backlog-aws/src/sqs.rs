//! The shared work queue on SQS.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName, QueueAttributeName};
use backlog_core::{QueueMessage, ReceiveOptions, ServiceResult, WorkQueue};
use tracing::{debug, info};

use crate::error::{AwsError, AwsResult};

/// Longest long-poll SQS accepts.
const MAX_WAIT_SECS: u64 = 20;
/// Longest visibility timeout SQS accepts.
const MAX_VISIBILITY_SECS: u64 = 43_200;

/// The shared work queue, addressed by its resolved URL.
pub struct SqsQueue {
    client: Client,
    name: String,
    url: String,
}

impl SqsQueue {
    /// Resolve `name` to its queue URL.
    pub async fn connect(config: &SdkConfig, name: &str) -> AwsResult<Self> {
        Self::with_client(Client::new(config), name).await
    }

    /// Resolve `name` with an already configured client.
    pub async fn with_client(client: Client, name: &str) -> AwsResult<Self> {
        let out = client
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| AwsError::from_sdk("GetQueueUrl", e))?;
        let url = out
            .queue_url()
            .ok_or_else(|| AwsError::Decode {
                operation: "GetQueueUrl",
                reason: "no QueueUrl".to_string(),
            })?
            .to_string();
        info!(queue = name, %url, "queue resolved");
        Ok(Self {
            client,
            name: name.to_string(),
            url,
        })
    }
}

/// Convert one received message. A missing receive count is treated as a
/// first delivery.
pub fn decode_message(m: &Message) -> AwsResult<QueueMessage> {
    let missing = |field: &str| AwsError::Decode {
        operation: "ReceiveMessage",
        reason: format!("message without {field}"),
    };
    Ok(QueueMessage {
        message_id: m.message_id().ok_or_else(|| missing("MessageId"))?.to_string(),
        receipt: m.receipt_handle().ok_or_else(|| missing("ReceiptHandle"))?.to_string(),
        body: m.body().unwrap_or_default().to_string(),
        receive_count: m
            .attributes()
            .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|v| v.parse().ok())
            .unwrap_or(1),
    })
}

#[async_trait]
impl WorkQueue for SqsQueue {
    async fn receive(&self, opts: ReceiveOptions) -> ServiceResult<Vec<QueueMessage>> {
        let mut req = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(opts.max_messages.clamp(1, 10) as i32)
            .wait_time_seconds(opts.wait.as_secs().min(MAX_WAIT_SECS) as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount);
        if let Some(visibility) = opts.visibility_timeout {
            req = req.visibility_timeout(visibility.as_secs().min(MAX_VISIBILITY_SECS) as i32);
        }
        let out = req
            .send()
            .await
            .map_err(|e| AwsError::from_sdk("ReceiveMessage", e))?;

        let messages = out
            .messages()
            .iter()
            .map(decode_message)
            .collect::<AwsResult<Vec<_>>>()?;
        debug!(queue = %self.name, received = messages.len(), "long-poll returned");
        Ok(messages)
    }

    async fn delete(&self, receipt: &str) -> ServiceResult<()> {
        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| AwsError::from_sdk("DeleteMessage", e))?;
        Ok(())
    }

    async fn approximate_depth(&self) -> ServiceResult<u64> {
        let out = self
            .client
            .get_queue_attributes()
            .queue_url(&self.url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| AwsError::from_sdk("GetQueueAttributes", e))?;
        let depth = out
            .attributes()
            .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| AwsError::Decode {
                operation: "GetQueueAttributes",
                reason: "no ApproximateNumberOfMessages".to_string(),
            })?;
        Ok(depth)
    }

    async fn send(&self, body: &str) -> ServiceResult<String> {
        let out = self
            .client
            .send_message()
            .queue_url(&self.url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| AwsError::from_sdk("SendMessage", e))?;
        let id = out.message_id().unwrap_or_default().to_string();
        info!(queue = %self.name, message_id = %id, "job enqueued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_received_messages() {
        let m = Message::builder()
            .message_id("5fea7756-0ea4-451a-a703-a558b933e274")
            .receipt_handle("MbZj6wDWli+JvwwJaBV+3dcjk2YW2vA3+STFFljTM8tJJg6HRG6PYSasuWXPJB+Cw")
            .body("{\"exec_cmd\":\"nvidia-smi\"}")
            .attributes(MessageSystemAttributeName::ApproximateReceiveCount, "3")
            .build();
        let decoded = decode_message(&m).unwrap();
        assert_eq!(decoded.message_id, "5fea7756-0ea4-451a-a703-a558b933e274");
        assert_eq!(decoded.receive_count, 3);
        assert!(decoded.is_redelivery());
        assert!(decoded.job().is_ok());
    }

    #[test]
    fn missing_receive_count_defaults_to_first_delivery() {
        let m = Message::builder().message_id("m").receipt_handle("r").body("{}").build();
        assert_eq!(decode_message(&m).unwrap().receive_count, 1);
    }

    #[test]
    fn message_without_receipt_is_rejected() {
        let m = Message::builder().message_id("m").body("{}").build();
        assert!(decode_message(&m).is_err());
    }
}
