//! Two cores joined by virtual callables, with channels as the transport.
//!
//! Run with `RUST_LOG=trace cargo run --example bridge`.

use std::time::Duration;

use callwire::{Callable, ChannelWriter, Core, Function, RequestContext};
use tracing_subscriber::EnvFilter;

async fn reverse(_ctx: RequestContext, s: String) -> callwire::Result<String> {
    Ok(s.chars().rev().collect())
}

/// Forward every frame written by one side into the other side's reads.
fn pipe(mut frames: tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>, to: Callable) {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = to.mock_read_data(frame).await {
                tracing::warn!("bridge stopped: {}", e);
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> callwire::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let left = Core::new();
    let right = Core::new();
    right.register(Function::with_input_output(reverse), &[])?;
    left.start();
    right.start();

    let (left_writer, from_left) = ChannelWriter::new();
    let (right_writer, from_right) = ChannelWriter::new();
    let left_side = Callable::new_virtual(&left, left_writer);
    let right_side = Callable::new_virtual(&right, right_writer);
    left_side.start();
    right_side.start();

    pipe(from_left, right_side.clone());
    pipe(from_right, left_side.clone());

    let mut out = String::new();
    left_side
        .call_in_out(Duration::from_secs(1), "reverse", "callwire".to_string(), &mut out)
        .await?;
    println!("reverse -> {}", out);

    left_side.close()?;
    right_side.close()?;
    Ok(())
}
