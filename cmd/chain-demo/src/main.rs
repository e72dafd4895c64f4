//! Causal chain example
//!
//! Builds a policy error caused by a missing git object, prints its JSON, walks
//! the chain, and tears everything down in order.
//!
//! # Environment Variables
//!
//! - `GL_LOG_LEVEL=debug` - Show context lifecycle lines
//! - `GL_FLUSH_EPRINT=1` - Flush diagnostics immediately
//! - `CHAIN_DEPTH=<n>` - Extra wrapping layers to add (default: 0)

use std::process::ExitCode;

use gitledger::{json_copy, ledger_error, ledger_error_with_cause, Code, ContextConfig, Domain};
use gitledger::{Context, CoreResult, Release, MAX_DEPTH};

// GL_LOG_LEVEL=debug CHAIN_DEPTH=70 cargo run -p gitledger-chain-demo
fn run() -> CoreResult<()> {
    println!("=== gitledger chain demo ===\n");

    let ctx = Context::with_config(ContextConfig::from_env())?;
    let extra: usize = std::env::var("CHAIN_DEPTH")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    let leaf = ledger_error!(&ctx, Domain::Git, Code::NotFound, "Object {} not found", "abc123")?;
    let mut top = ledger_error_with_cause!(
        &ctx,
        Domain::Policy,
        Code::PolicyViolation,
        &leaf,
        "Policy blocked update for {}",
        "refs/main"
    )?;
    for i in 0..extra {
        top = ledger_error_with_cause!(&ctx, Domain::Generic, Code::Unknown, &top, "layer {}", i)?;
    }

    println!("{}\n", top);
    println!("json:  {}\n", top.json());
    println!("flags: {}", top.flags());

    let mut depth = 0;
    top.walk(|e| {
        println!("  #{:<2} {}", depth, e);
        depth += 1;
        true
    });
    if depth == MAX_DEPTH {
        println!("  (walk stopped at {} links)", MAX_DEPTH);
    }

    let copy = json_copy(&ctx, &top)?;
    println!("\ncopy:  {} bytes, live errors: {}", copy.len(), ctx.live_errors());

    drop(top);
    drop(leaf);
    match ctx.try_release() {
        Release::Destroyed => println!("context destroyed"),
        other => println!("context not destroyed: {:?}", other),
    }

    // The copy was allocated through the context but frees on its own
    println!("copy still readable: {}", copy.starts_with("{\"domain\""));
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("chain-demo: {}", e);
            ExitCode::FAILURE
        }
    }
}
