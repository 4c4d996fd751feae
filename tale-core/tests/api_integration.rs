//! Integration tests that call the real Claude API.
//!
//! These tests require ANTHROPIC_API_KEY to be set (via .env file or environment).
//! Run with: `cargo test -p tale-core --test api_integration -- --ignored --nocapture`

use std::sync::Arc;
use tale_core::{
    ClassificationSignal, ClaudeModel, InMemoryTranscript, MemoryOrchestrator, RetrievalConfig, ConfigHandle,
};
use tokio_util::sync::CancellationToken;

/// Load environment variables from .env file
fn setup() {
    let _ = dotenvy::dotenv();
    tale_core::telemetry::init();
}

/// Check if API key is available
fn has_api_key() -> bool {
    std::env::var("ANTHROPIC_API_KEY").is_ok()
}

const STORY: &[(&str, &str)] = &[
    ("I wake on the ferry and look for Mira.", "Mira is at the rail, sketching the coastline of Vharn into her map."),
    ("I ask her what the ferryman wanted last night.", "She frowns. 'A silver coin for every head, and a favor owed later.'"),
    ("I agree to owe him the favor.", "The ferryman grins and scratches your name into his ledger."),
    ("We disembark at Vharn.", "The docks are loud with gulls and fishmongers. Tobin waves from a cart."),
    ("I greet Tobin and climb into the cart.", "Tobin hands you a letter sealed with black wax."),
    ("I open the letter.", "It is a summons from the Harbor Council, dated three days ago."),
    ("We ride toward the council hall.", "Rain begins as the cart rattles over cobblestones."),
    ("I ask Tobin who sent for us.", "'Councilor Hesk,' he says. 'She does not like waiting.'"),
];

fn transcript_with_story() -> Arc<InMemoryTranscript> {
    let transcript = Arc::new(InMemoryTranscript::new());
    for (user, assistant) in STORY {
        transcript.push_user(*user);
        transcript.push_assistant(*assistant);
    }
    transcript
}

#[tokio::test]
#[ignore]
async fn test_live_chapter_creation_and_retrieval() {
    setup();
    if !has_api_key() {
        eprintln!("Skipping test: ANTHROPIC_API_KEY not set");
        return;
    }

    let transcript = transcript_with_story();
    let config = RetrievalConfig::default().with_chapter_size(12).with_protected_buffer(4);
    let model = Arc::new(ClaudeModel::from_env().expect("Failed to create model"));
    let memory = MemoryOrchestrator::builder(model, transcript.clone())
        .config(ConfigHandle::new(config))
        .build();

    let outcome = memory
        .on_assistant_turn_classified(&ClassificationSignal::boundary())
        .expect("chapter creation should start")
        .wait()
        .await;
    let chapter = outcome.chapter().expect("chapter should be created");
    println!("Chapter {}: {} (turns {}-{})", chapter.number, chapter.title, chapter.start_position, chapter.end_position);
    println!("{}", chapter.summary);
    println!("Metadata: {:?}", chapter.metadata);
    assert_eq!(chapter.start_position, 1);
    assert!(chapter.end_position <= 12);

    let context = memory
        .on_user_turn("I remind the ferryman that I already paid my coin.", &CancellationToken::new())
        .await
        .expect("retrieval should not error");
    println!("Retrieved: {context:#?}");
}
