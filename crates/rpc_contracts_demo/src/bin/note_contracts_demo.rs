#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;

use rpc_contracts::{tracing_sink, ContractConfig, ServerContract};
use rpc_contracts_demo::{build_server_contract, pb, AuthService, NoteStore, NoteStoreMode};
use tonic::Request;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log = env::var("NOTE_DEMO_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log))
        .init();

    let config = ContractConfig::from_env();
    let mode = parse_mode_from_env();
    tracing::info!(?config, ?mode, "note contracts demo starting");

    let contract = build_server_contract(ServerContract::with_config(config, tracing_sink()))?;
    let store = NoteStore::new(&contract, Arc::new(AuthService::default()), mode);

    let scenarios = [
        ("valid lookup", 1, "some-token-0"),
        ("negative note id", -1, "some-token-0"),
        ("unknown note", 7, "some-token-1"),
        ("bad token", 0, "not-a-token"),
    ];
    for (name, note_id, token) in scenarios {
        let request = Request::new(pb::GetNoteRequest {
            note_id,
            token: token.to_string(),
        });
        match store.get_note(request).await {
            Ok(response) => {
                let note = response.into_inner();
                tracing::info!(scenario = name, note_id = note.note_id, text = %note.text, "GetNote ok");
            }
            Err(status) => {
                tracing::info!(scenario = name, code = ?status.code(), message = %status.message(), "GetNote failed");
            }
        }
    }

    tracing::info!(
        active_requests = contract.history().active_requests(),
        "note contracts demo finished"
    );
    Ok(())
}

fn parse_mode_from_env() -> NoteStoreMode {
    match env::var("NOTE_DEMO_MODE") {
        Ok(v) if v.trim().eq_ignore_ascii_case("off_by_one") => NoteStoreMode::OffByOne,
        _ => NoteStoreMode::Correct,
    }
}
