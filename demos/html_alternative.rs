//! HTML Email with Text Alternative Example
//!
//! This example demonstrates how to:
//! - Build a connection context in code
//! - Compose an HTML email with a plaintext alternative
//! - Stamp the date and send the composed message

use integrations_smtp_mailer::message::{self, MessageHeaders};
use integrations_smtp_mailer::{ConnectionContext, SmtpError};

#[tokio::main]
async fn main() -> Result<(), SmtpError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // Authenticated submission over STARTTLS on port 587
    let ctx = ConnectionContext::builder()
        .host("smtp.example.com")
        .credentials("user@example.com", "your-password")
        .starttls(true)
        .debug(true)
        .build()?;

    let text_body = r#"
Welcome to Our Service!

Thank you for signing up. Verify your email address to get started.

Best regards,
The Team
"#
    .trim();

    let html_body = r#"
<!DOCTYPE html>
<html>
<body>
    <h1>Welcome to Our Service!</h1>
    <p>Thank you for signing up. <a href="https://example.com/verify">Verify your email address</a> to get started.</p>
    <p>Best regards,<br>The Team</p>
</body>
</html>
"#
    .trim();

    let headers = MessageHeaders::new()
        .from("The Team <team@example.com>")
        .to("Jürgen Müller <juergen@example.com>")
        .reply_to("support@example.com")
        .subject("Willkommen, Jürgen!");

    let composed = message::compose_html_plaintext_alternative(&ctx, html_body, text_body, headers)?;
    println!("Composed message {}", composed.message_id());

    let report = message::send_message(&ctx, composed).await?;
    println!(
        "Delivered to {} recipient(s): {}",
        report.accepted.len(),
        report.response
    );

    Ok(())
}
