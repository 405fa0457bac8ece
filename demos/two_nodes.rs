//! Two-node graph: a research node hands off to a response node.
//!
//! Needs OPENAI_API_KEY. Run with:
//!   cargo run --example two_nodes

use std::io::Write;

use agent_graph::{Channel, Event, Graph, Node, OpenAiProvider, ProcessContext};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Ok(api_key) = std::env::var("OPENAI_API_KEY") else {
        eprintln!("set OPENAI_API_KEY to run this demo");
        return;
    };

    let respond = Node::builder("respond")
        .instructions(
            "Write the final answer for the user, based on the research notes \
             in your context. Keep it to two sentences.",
        )
        .build();

    let research = Node::builder("research")
        .instructions(
            "List the physical facts needed to answer the user's question, \
             as short bullet points.",
        )
        .input("Why is the sky blue?")
        .route(respond.id().clone(), "always, once the notes are complete")
        .build();
    let start = research.id().clone();

    let mut graph = Graph::builder("two-nodes")
        .register(research)
        .register(respond)
        .build()
        .unwrap();

    let mut ctx = ProcessContext::new();
    ctx.set_provider(Box::new(OpenAiProvider::new(api_key, "gpt-4.1-mini")));

    ctx.events.on(Channel::Text, |e| {
        if let Event::Text(delta) = e {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
    });
    ctx.events.on(Channel::Start, |e| {
        if let Event::Start { round } = e {
            println!("\n--- round {round} ---");
        }
    });
    ctx.events.on(Channel::Error, |e| {
        if let Event::Error(message) = e {
            eprintln!("\n[error] {message}");
        }
    });

    if let Err(e) = graph.run(&start, &mut ctx) {
        eprintln!("run failed: {e}");
    }
    println!();
}
