use mirror_demo::{demo_conflict_merge, demo_many_documents, demo_rapid_edits};
pub mod mirror_demo;

fn main() {
    tracing_subscriber::fmt::init();
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async_main());
}

async fn async_main() {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            MIRROR SESSION DEMOS                             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Demo 1: burst of rapid edits on one document
    let stats = demo_rapid_edits(200).await;
    stats.print();

    // Demo 2: many independent documents editing concurrently
    let stats = demo_many_documents(10, 50).await;
    stats.print();

    // Demo 3: foreign write racing an in-flight push
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          CONFLICT MERGE                                     ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    demo_conflict_merge().await;

    println!("\n✓ All demos completed successfully!");
}
