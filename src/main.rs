use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use agent_gate::concurrency::{ConcurrentProcessor, PoolConnection};
use agent_gate::config::{ConcurrencyConfig, RateLimitConfig};
use agent_gate::error::{AgentError, Error, LlmError};
use agent_gate::resilience::{CircuitBreakerConfig, ErrorContext, ErrorHandler, RetryConfig};

/// Stand-in for an HTTP client session to an LLM provider.
struct SimulatedLlmClient {
    provider: String,
    session: Uuid,
    calls: AtomicU64,
}

impl SimulatedLlmClient {
    async fn generate(&self, prompt: &str) -> agent_gate::Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        if n % 7 == 6 {
            return Err(LlmError::ServerError {
                provider: self.provider.clone(),
                reason: "503 Service Unavailable".into(),
            }
            .into());
        }
        Ok(format!("[{}] response to: {prompt}", self.provider))
    }
}

#[async_trait]
impl PoolConnection for SimulatedLlmClient {
    async fn close(&self) {
        tracing::debug!(provider = %self.provider, session = %self.session, "Closing LLM session");
    }
}

async fn run_agent(name: &str, input: &str) -> agent_gate::Result<String> {
    if input.is_empty() {
        return Err(AgentError::InvalidInput {
            agent: name.to_string(),
            reason: "empty input".into(),
        }
        .into());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(format!("{name} handled '{input}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ConcurrencyConfig::from_env();
    let rate_limit = RateLimitConfig::from_env();

    eprintln!("Agent Gate v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Concurrency: {} global, {} per agent, {} per provider",
        config.max_concurrent_requests,
        config.max_concurrent_per_agent,
        config.max_concurrent_per_llm_provider
    );
    eprintln!(
        "   Rate limit: {}/min, {}/hour, burst {}\n",
        rate_limit.requests_per_minute, rate_limit.requests_per_hour, rate_limit.burst_limit
    );

    let processor = Arc::new(ConcurrentProcessor::new(config, rate_limit)?);
    let handler = Arc::new(ErrorHandler::new());
    processor.start().await;

    // Agents: a burst of requests spread over a few agents.
    let mut tasks = Vec::new();
    for i in 0..12 {
        let processor = Arc::clone(&processor);
        let handler = Arc::clone(&handler);
        tasks.push(tokio::spawn(async move {
            let agent = format!("agent-{}", i % 3);
            let input = if i == 5 { String::new() } else { format!("ticket #{i}") };
            let request_id = Uuid::new_v4().to_string();
            match processor
                .process_request(&request_id, &agent, || run_agent(&agent, &input))
                .await
            {
                Ok(output) => tracing::info!(request_id = %request_id, "{output}"),
                Err(e) => {
                    let context = ErrorContext::new("agent", "process")
                        .with_request_id(&request_id)
                        .with_agent(&agent);
                    let response = handler.handle_error(&e, &context, true);
                    tracing::info!(code = %response.error_code, "Agent request failed");
                }
            }
        }));
    }
    for task in tasks {
        task.await?;
    }

    // LLM providers: pooled sessions behind a breaker, with retry on top.
    let retry_config = RetryConfig {
        base_delay: Duration::from_millis(200),
        ..RetryConfig::default()
    };
    let mut tasks = Vec::new();
    for (i, provider) in ["anthropic", "openai"].iter().cycle().take(6).enumerate() {
        let provider = provider.to_string();
        let pool = processor.get_connection_pool(
            &format!("llm:{provider}"),
            {
                let provider = provider.clone();
                move || {
                    let provider = provider.clone();
                    async move {
                        Ok(SimulatedLlmClient {
                            provider,
                            session: Uuid::new_v4(),
                            calls: AtomicU64::new(0),
                        })
                    }
                }
            },
            2,
        )?;
        let processor = Arc::clone(&processor);
        let handler = Arc::clone(&handler);
        let retry_config = retry_config.clone();
        tasks.push(tokio::spawn(async move {
            let prompt = format!("summarise document {i}");
            let breaker = CircuitBreakerConfig::new(provider.as_str()).with_failure_threshold(3);
            let (handler_ref, processor, pool) = (&*handler, &*processor, &*pool);
            let (provider_ref, prompt) = (provider.as_str(), prompt.as_str());
            let result = handler
                .with_retry(&retry_config, || {
                    let request_id = format!("llm-{i}");
                    let breaker = breaker.clone();
                    async move {
                        handler_ref
                            .call_with_circuit_breaker(breaker, || async move {
                                processor
                                    .process_llm_request(&request_id, provider_ref, || async move {
                                        let client = pool.acquire().await?;
                                        client.generate(prompt).await
                                    })
                                    .await
                            })
                            .await
                    }
                })
                .await;
            match result {
                Ok(text) => tracing::info!("{text}"),
                Err(e) => {
                    let context = ErrorContext::new("llm", "generate").with_request_id(format!("llm-{i}"));
                    handler.handle_error(&e, &context, true);
                }
            }
        }));
    }
    for task in tasks {
        task.await?;
    }

    // Batch: one call per group of inputs.
    let requests: Vec<(String, String)> = (0..7)
        .map(|i| (format!("batch-{i}"), format!("item {i}")))
        .collect();
    match processor
        .batch_process(requests, |texts: Vec<String>| async move {
            tracing::info!(size = texts.len(), "Processing batch");
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, Error>(texts.into_iter().map(|t| t.to_uppercase()).collect::<Vec<_>>())
        })
        .await
    {
        Ok(results) => tracing::info!(count = results.len(), "Batch complete"),
        Err(e) => {
            let context = ErrorContext::new("batch", "process");
            let response = handler.handle_error(&e, &context, true);
            tracing::info!(code = %response.error_code, "Batch rejected");
        }
    }

    let status = processor.get_status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    println!(
        "{}",
        serde_json::to_string_pretty(&handler.get_error_statistics())?
    );

    processor.stop().await;
    eprintln!("\nShutdown complete.");
    Ok(())
}
