use leasekeeper::{
    DriverBuilder, DriverConfig, HandlerError, HandlerResult, Latency, MemoryQueue, Payload,
    TokioSpawner,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let queue = MemoryQueue::new()
        .latency(Latency::uniform(std::time::Duration::from_millis(50)))
        .visibility_timeout(std::time::Duration::from_secs(4));
    let config = DriverConfig::new(
        std::time::Duration::from_millis(500),
        std::time::Duration::from_secs(4),
    );
    let mut driver = DriverBuilder::new(config)
        .handler(job_handler)
        .spawner(TokioSpawner)
        .build(queue);

    for n in 0..5_u64 {
        match driver.submit(n).await {
            Ok(()) => tracing::info!("Enqueue job {}", n),
            Err(error) => tracing::error!(error = %error, "Failed to enqueue job"),
        }
    }

    if let Err(error) = driver.start() {
        tracing::error!(error = %error, "Failed to start driver");
        return;
    }
    tokio::time::sleep(std::time::Duration::from_secs(12)).await;

    tracing::info!("Stopping");
    if let Err(error) = driver.stop().await {
        tracing::error!(error = %error, "Driver ended with error");
    }
    tracing::info!(left = driver.queue().len(), "Stopped");
    for (token, error) in driver.queue().drain_acknowledgements() {
        if error.is_empty() {
            tracing::info!(lease_token = %token, "done");
        } else {
            tracing::warn!(lease_token = %token, error = %error, "failed");
        }
    }
}

async fn job_handler(Payload(count): Payload<u64>) -> HandlerResult {
    tracing::info!("-start: job {}", count);
    tokio::time::sleep(std::time::Duration::from_secs(count % 3 + 1)).await;
    tracing::info!("--end: job {}", count);

    if count % 4 == 3 {
        return Err(HandlerError::Message(format!("job {count} is unlucky")));
    }
    Ok(())
}
