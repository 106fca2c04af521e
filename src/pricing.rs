// src/pricing.rs

use crate::types::TokenUsage;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// US dollars per 1000 tokens, input and output.
#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Static price table keyed by `provider/model_name`. Pricing is advisory:
/// models missing from the table cost zero.
static PRICE_TABLE: Lazy<HashMap<&'static str, ModelPrice>> = Lazy::new(|| {
    let mut table = HashMap::new();
    let mut add = |model, input_per_1k, output_per_1k| {
        table.insert(
            model,
            ModelPrice {
                input_per_1k,
                output_per_1k,
            },
        );
    };
    add("openai/gpt-4o", 0.0025, 0.01);
    add("openai/gpt-4o-mini", 0.00015, 0.0006);
    add("openai/text-embedding-3-small", 0.00002, 0.0);
    add("anthropic/claude-sonnet-4-20250514", 0.003, 0.015);
    add("anthropic/claude-3-5-haiku-20241022", 0.0008, 0.004);
    add("gemini/gemini-2.0-flash", 0.0001, 0.0004);
    add("gemini/gemini-1.5-pro", 0.00125, 0.005);
    add("mistral/mistral-large-latest", 0.002, 0.006);
    table
});

/// Approximate cost of one completed request. Unknown models yield 0.0.
pub fn approximate_cost(model: &str, usage: &TokenUsage) -> f64 {
    match PRICE_TABLE.get(model) {
        Some(price) => {
            (usage.prompt_tokens as f64 / 1000.0) * price.input_per_1k
                + (usage.completion_tokens as f64 / 1000.0) * price.output_per_1k
        }
        None => 0.0,
    }
}
