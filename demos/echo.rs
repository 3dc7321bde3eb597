//! Echo server and client over TCP in one process.
//!
//! Run with `RUST_LOG=debug cargo run --example echo`.

use std::time::Duration;

use callwire::middleware::{dump, recover};
use callwire::{Callable, Core, Function, RequestContext, TcpAcceptor};
use tracing_subscriber::EnvFilter;

async fn echo(ctx: RequestContext, s: String) -> callwire::Result<String> {
    tracing::info!("echo {} from request {}", s, ctx.id());
    Ok(s)
}

async fn sum(_ctx: RequestContext, values: Vec<i64>) -> callwire::Result<i64> {
    Ok(values.iter().sum())
}

#[tokio::main]
async fn main() -> callwire::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = Core::new();
    server.pre_use([recover(), dump()]);
    server.register(Function::with_input_output(echo), &[])?;
    server.register(Function::with_input_output(sum), &[])?;
    server.start();

    let acceptor = TcpAcceptor::bind(&server, "127.0.0.1:0").await?;
    let addr = acceptor.local_addr()?;
    tokio::spawn(async move {
        while let Ok(callable) = acceptor.accept().await {
            callable.start();
        }
    });

    let client = Core::new();
    client.start();
    let callable = Callable::connect(&client, addr).await?;
    callable.start();

    let timeout = Duration::from_secs(1);
    let mut reply = String::new();
    callable
        .call_in_out(timeout, "echo", "hello".to_string(), &mut reply)
        .await?;
    println!("echo -> {}", reply);

    let mut total = 0i64;
    callable
        .call_in_out(timeout, "sum", vec![1i64, 2, 3, 4], &mut total)
        .await?;
    println!("sum -> {}", total);

    if let Err(e) = callable.call(timeout, "missing").await {
        println!("missing -> {}", e);
    }

    callable.close()?;
    client.close();
    server.close();
    Ok(())
}
