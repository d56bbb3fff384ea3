//! Walkthrough command implementation.
//!
//! Drives the whole cache lifecycle against an in-process service backed by
//! the estimating tokenizer, the in-memory blob store, and the mock engine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use cachet_abstraction::ContentPart;
use cachet_core::{
    CacheError, CacheService, CachedContentInfo, ChatSession, CreateCacheRequest,
    EstimatingTokenizer, GenerationResponse, InMemoryBlobStore, MockEngine,
};
use colored::Colorize;
use serde_json::{Value, json};

/// Model used when none is given.
pub const DEFAULT_MODEL: &str = "gemini-1.5-pro-001";

const SYSTEM_INSTRUCTION: &str = "You are an expert researcher who has years of experience in conducting \
systematic literature surveys and meta-analyses of different topics. You always stick to the facts in \
the sources provided, and never make up new facts. Now look at the research papers below, and answer \
the following questions in 1-2 sentences.";

/// Papers referenced by the walkthrough cache, with their sizes in bytes.
const PAPERS: [(&str, u64); 3] = [
    ("gs://cloud-samples-data/generative-ai/pdf/2312.11805v3.pdf", 2_400_000),
    ("gs://cloud-samples-data/generative-ai/pdf/2403.05530.pdf", 1_900_000),
    ("gs://cachet-samples/fee-estimate-2023.pdf", 160_000),
];

const QUESTION: &str = "What is the research goal shared by these research papers?";

const CHAT: [&str; 2] = [
    "How do the approaches to responsible AI development and mitigation strategies in Gemini 1.5 evolve from those in Gemini 1.0?",
    "Given the advancements presented in Gemini 1.5, what are the key future research directions identified in both papers for further improving multimodal AI models?",
];

/// Execute the walkthrough command.
pub async fn execute(root: &Path, model: &str, ttl_minutes: u64, json_output: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;

    let blobs = Arc::new(InMemoryBlobStore::new());
    for (uri, size) in PAPERS {
        blobs.insert(uri, "application/pdf", size);
    }
    let service = Arc::new(
        CacheService::new(config, Arc::new(EstimatingTokenizer), blobs, Arc::new(MockEngine::new("mock")))
            .context("Failed to build cache service")?,
    );
    let sweeper = service.start_sweeper();

    let result = run(&service, model, ttl_minutes, json_output).await;
    sweeper.shutdown().await;
    result
}

async fn run(service: &Arc<CacheService>, model: &str, ttl_minutes: u64, json_output: bool) -> anyhow::Result<()> {
    let mut report = json!({});
    let printer = Printer { json: json_output };

    // 1. Create
    let request = PAPERS.iter().fold(
        CreateCacheRequest::new(model)
            .with_system_instruction(SYSTEM_INSTRUCTION)
            .with_display_name("research-papers")
            .with_ttl(Duration::from_secs(ttl_minutes.saturating_mul(60))),
        |request, (uri, _)| request.with_part(ContentPart::file_data(*uri, "application/pdf")),
    );
    let created = service.create_cache(request).await.context("Failed to create cache")?;
    printer.section("Created context cache");
    printer.info(&created);
    report["created"] = serde_json::to_value(&created)?;

    // 2. Retrieve by resource name
    let fetched = service.get_cache(&created.resource_name)?;
    printer.line(&format!("Retrieved by resource name: state {}", fetched.state));

    // 3. Generate
    let answer = service
        .generate_with_cache(&created.id, model, vec![ContentPart::text(QUESTION)])
        .await
        .context("Generation with cache failed")?;
    printer.section("Question");
    printer.exchange(QUESTION, &answer);
    report["question"] = exchange_json(QUESTION, &answer)?;

    // 4. Chat
    printer.section("Chat");
    let mut chat = ChatSession::new(Arc::clone(service), created.resource_name.clone(), model);
    let mut turns = Vec::new();
    for prompt in CHAT {
        let response = chat.send_message(vec![ContentPart::text(prompt)]).await?;
        printer.exchange(prompt, &response);
        turns.push(exchange_json(prompt, &response)?);
    }
    printer.line(&format!("History holds {} turns", chat.history().len()));
    report["chat"] = Value::Array(turns);
    report["history"] = serde_json::to_value(chat.history())?;

    // 5. Update TTL
    let updated = service.update_cache(&created.id, Some(Duration::from_secs(3600)), None)?;
    printer.section("Updated expiration");
    printer.line(&format!("expire_time: {}", updated.expire_time.to_rfc3339()));
    report["updated"] = serde_json::to_value(&updated)?;

    // 6. List
    let listed = service.list_caches()?;
    printer.line(&format!("Caches listed: {}", listed.len()));

    // 7. Delete
    let outcome = service.delete_cache(&created.id).await?;
    printer.section("Deleted context cache");
    printer.line(&format!("outcome: {outcome:?}"));
    report["deleted"] = serde_json::to_value(outcome)?;

    // 8. Using the deleted cache must fail
    match service.generate_with_cache(&created.id, model, vec![ContentPart::text(QUESTION)]).await {
        Err(e @ CacheError::NotFound(_)) => {
            printer.line(&format!("Generation after delete fails: {}", e.to_string().yellow()));
            report["after_delete"] = json!({ "error": "NotFound", "message": e.to_string() });
        }
        Err(e) => bail!("expected NotFound after delete, got: {e}"),
        Ok(_) => bail!("generation succeeded against a deleted cache"),
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

fn exchange_json(prompt: &str, response: &GenerationResponse) -> anyhow::Result<Value> {
    Ok(json!({
        "prompt": prompt,
        "response": response.text,
        "usage_metadata": serde_json::to_value(response.usage_metadata)?,
    }))
}

/// Human-readable output; silent in JSON mode.
struct Printer {
    json: bool,
}

impl Printer {
    fn section(&self, title: &str) {
        if !self.json {
            println!();
            println!("{}", title.bold().cyan());
        }
    }

    fn line(&self, text: &str) {
        if !self.json {
            println!("  {text}");
        }
    }

    fn info(&self, info: &CachedContentInfo) {
        self.line(&format!("id: {}", info.id.green()));
        self.line(&format!("resource_name: {}", info.resource_name));
        self.line(&format!("model: {}", info.model_id));
        self.line(&format!("create_time: {}", info.create_time.to_rfc3339()));
        self.line(&format!("expire_time: {}", info.expire_time.to_rfc3339()));
        self.line(&format!("token_count: {}", info.token_count));
    }

    fn exchange(&self, prompt: &str, response: &GenerationResponse) {
        let usage = response.usage_metadata;
        self.line(&format!("{} {}", "user:".dimmed(), prompt));
        self.line(&format!("{} {}", "model:".dimmed(), response.text));
        self.line(
            &format!(
                "tokens: prompt {} (cached {}), candidates {}, total {}",
                usage.prompt_token_count,
                usage.cached_content_token_count,
                usage.candidates_token_count,
                usage.total_token_count
            )
            .dimmed()
            .to_string(),
        );
    }
}
