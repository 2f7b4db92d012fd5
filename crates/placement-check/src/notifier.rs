use anyhow::Context;
use async_trait::async_trait;
use placement_api_types::InboxOutcome;
use reqwest::Url;
use serde::Serialize;
use std::time::Duration;

/// Delivers a finished report to the user who requested the test.
/// Delivery is best effort: errors are logged by the caller and
/// otherwise ignored.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(
        &self,
        user_email: &str,
        test_code: &str,
        results: &[InboxOutcome],
    ) -> anyhow::Result<()>;
}

pub fn report_subject(test_code: &str) -> String {
    format!("Email Deliverability Report - {test_code}")
}

pub fn report_text(test_code: &str, results: &[InboxOutcome]) -> String {
    let lines: Vec<String> = results.iter().map(|r| r.to_string()).collect();
    format!(
        "Your report for test code {test_code}.\nResults: {}",
        lines.join("\n")
    )
}

pub fn report_html(test_code: &str, results: &[InboxOutcome]) -> String {
    let lines: Vec<String> = results.iter().map(|r| r.to_string()).collect();
    format!(
        "<h1>Email Deliverability Report</h1><p>Test Code: {test_code}</p><p>Results: {}</p>",
        lines.join("<br>")
    )
}

/// Writes the report to the diagnostic log instead of sending it anywhere
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        user_email: &str,
        test_code: &str,
        results: &[InboxOutcome],
    ) -> anyhow::Result<()> {
        tracing::info!(
            "report for {user_email}: {}",
            report_text(test_code, results)
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct InjectRecipient<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct InjectRequest<'a> {
    envelope_sender: &'a str,
    recipients: Vec<InjectRecipient<'a>>,
    content: String,
}

/// Builds the report as an RFC 5322 message and submits it to an
/// HTTP injection endpoint, such as KumoMTA's `/api/inject/v1`.
pub struct HttpInjectNotifier {
    url: Url,
    sender: String,
    client: reqwest::Client,
}

impl HttpInjectNotifier {
    pub fn new(url: Url, sender: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            url,
            sender,
            client,
        })
    }

    pub fn build_message(
        &self,
        user_email: &str,
        test_code: &str,
        results: &[InboxOutcome],
    ) -> anyhow::Result<String> {
        mail_builder::MessageBuilder::new()
            .from(self.sender.as_str())
            .to(user_email)
            .subject(report_subject(test_code))
            .text_body(report_text(test_code, results))
            .html_body(report_html(test_code, results))
            .write_to_string()
            .context("building report message")
    }
}

#[async_trait]
impl Notifier for HttpInjectNotifier {
    async fn notify(
        &self,
        user_email: &str,
        test_code: &str,
        results: &[InboxOutcome],
    ) -> anyhow::Result<()> {
        let request = InjectRequest {
            envelope_sender: &self.sender,
            recipients: vec![InjectRecipient { email: user_email }],
            content: self.build_message(user_email, test_code, results)?,
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .with_context(|| format!("sending report to {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("injection via {} failed: {status}: {body}", self.url);
        }

        tracing::info!("Report emailed to {user_email}");
        Ok(())
    }
}
