//! Demo host for the payment engine.
//!
//! Loads configuration from the environment (and a `.env` file when
//! present), mints one payment form, prints the wallet links a real host
//! would render as a QR code, then reconciles until Ctrl-C.

use tronpay_core::entities::Currency;
use tronpay_core::forms::CreateFormRequest;
use tronpay_core::{PaymentConfig, PaymentProcessor};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the environment may be set directly.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = PaymentConfig::from_env()?;
    let processor = PaymentProcessor::new(config).await?;

    let form = processor
        .create_payment_form(CreateFormRequest {
            amount: 5.0,
            currency: Currency::Usdt,
            description: "Demo payment".to_string(),
            expires_hours: Some(1),
            client_ip: None,
            user_id: None,
        })
        .await?;

    println!("Payment form:   {}", form.form_id);
    println!("Send exactly:   {} {}", form.amount, form.currency);
    println!("Wallet link:    {}", processor.generate_payment_url(&form.form_id).await?);
    println!("QR payload:     {}", processor.generate_payment_qr_data(&form.form_id).await?);

    processor.register_payment_callback(
        &form.form_id,
        Box::new(|transfer, form_id| {
            println!("Form {form_id} paid by transaction {}", transfer.transaction_id);
            Ok(())
        }),
    );

    processor.start_monitoring(None);
    tracing::info!("reconciling payments; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    processor.stop_monitoring().await;
    processor.close().await;
    tracing::info!("demo host shut down");
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
