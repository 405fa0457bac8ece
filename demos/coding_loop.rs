//! Coding loop: implement a function in a scratch crate, verify with
//! `cargo test`, loop back on failure.
//!
//! Needs OPENAI_API_KEY. Run with:
//!   cargo run --example coding_loop

use std::io::Write;
use std::path::Path;

use agent_graph::tools::register_defaults;
use agent_graph::{
    Channel, Event, ExitGate, GateExpectation, Graph, Node, OpenAiProvider, ProcessContext,
};

fn scaffold_project(dir: &Path) {
    let src = dir.join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(
        dir.join("Cargo.toml"),
        "[package]\nname = \"scratch\"\nversion = \"0.1.0\"\nedition = \"2024\"\n",
    )
    .unwrap();
    std::fs::write(src.join("lib.rs"), "").unwrap();
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Ok(api_key) = std::env::var("OPENAI_API_KEY") else {
        eprintln!("set OPENAI_API_KEY to run this demo");
        return;
    };

    let workdir = std::env::temp_dir().join("agent-graph-coding-loop");
    scaffold_project(&workdir);

    let coding_tools = [
        "read_file_content",
        "write_file_content",
        "list_directory",
        "execute_shell_command",
    ];

    let summarize = Node::builder("summarize")
        .instructions("Summarize for the user what was implemented and how it was verified.")
        .build();

    let mut implement = Node::builder("implement")
        .instructions(
            "Implement the task in src/lib.rs, including unit tests. Read the \
             file first if it already has content. If the verifier sent you \
             back, fix the reported failures.",
        )
        .tools(coding_tools)
        .exit_gate(ExitGate::shell_check("cargo test --lib", GateExpectation::Pass))
        .max_round_trips(12);

    let verify = Node::builder("verify")
        .instructions(
            "Run `cargo test --lib` with the shell tool and judge the result.",
        )
        .tools(coding_tools)
        .route(implement.id().clone(), "any test failed or did not compile")
        .route(summarize.id().clone(), "every test passed");

    implement = implement.route(verify.id().clone(), "always, once the code is written");

    let implement = implement.build();
    let start = implement.id().clone();

    let mut graph = Graph::builder("coding-loop")
        .register(implement)
        .register(verify.build())
        .register(summarize)
        .build()
        .unwrap();
    register_defaults(graph.registry_mut()).unwrap();

    let mut ctx = ProcessContext::new();
    ctx.cwd = workdir.clone();
    ctx.set_provider(Box::new(OpenAiProvider::new(api_key, "gpt-4.1")));
    ctx.set(
        "task",
        "Add a function `reverse_string(s: &str) -> String` that reverses a \
         string, with unit tests covering empty and multi-byte input.",
    );

    ctx.events.on(Channel::Text, |e| {
        if let Event::Text(delta) = e {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
    });
    ctx.events.on(Channel::ToolCall, |e| {
        if let Event::ToolCall { name } = e {
            println!("\n[tool] {name}");
        }
    });
    ctx.events.on(Channel::Error, |e| {
        if let Event::Error(message) = e {
            eprintln!("\n[error] {message}");
        }
    });

    if let Err(e) = graph.run(&start, &mut ctx) {
        eprintln!("run failed: {e}");
        return;
    }

    println!("\n\nscratch project left at {}", workdir.display());
}
