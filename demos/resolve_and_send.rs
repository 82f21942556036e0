//! Resolve and Send Example
//!
//! This example demonstrates how to:
//! - Resolve a connection context from the environment
//! - Inspect configuration warnings
//! - Send a plaintext email to a list of recipients
//!
//! Run with, for example:
//! `SMTP_HOST=localhost SMTP_PORT=2525 cargo run --example resolve_and_send`

use integrations_smtp_mailer::message::{self, MessageHeaders};
use integrations_smtp_mailer::{ConfigSource, ContextResolver, SmtpError};

#[tokio::main]
async fn main() -> Result<(), SmtpError> {
    tracing_subscriber::fmt::init();

    // Explicit code, then the properties file or system properties, then
    // SMTP_* environment variables
    let source = ConfigSource::from_process();
    let resolution = ContextResolver::resolve_with_warnings(&source)?;
    for warning in &resolution.warnings {
        println!("Configuration warning: {}", warning);
    }

    let ctx = resolution.context;
    println!(
        "Sending through {}:{} (authenticated: {}, STARTTLS: {})",
        ctx.host(),
        ctx.port(),
        ctx.credentials().is_some(),
        ctx.use_starttls()
    );

    let headers = MessageHeaders::new()
        .from("Build Bot <builds@example.com>")
        .to("dev-team@example.com, \"Ops, On Call\" <oncall@example.com>")
        .subject("Nightly build finished");

    match message::send_plaintext(&ctx, "The nightly build completed successfully.", headers).await {
        Ok(report) => {
            println!("Message sent with ID: {}", report.message_id);
            for rejected in &report.rejected {
                println!("  rejected {} ({})", rejected.address, rejected.code);
            }
        }
        Err(e) => {
            eprintln!("Failed to send email: {}", e);
            if e.is_transient() {
                eprintln!("The error is transient; try again later.");
            }
            return Err(e);
        }
    }

    Ok(())
}
