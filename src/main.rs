use stress_test::{stress_test_remote, stress_test_scaling, stress_test_tabs};
pub mod stress_test;

#[tokio::main]
async fn main() -> trellis_sync::Result<()> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            TRELLIS SYNC STRESS TESTS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!("  Started at {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));

    // Test 1: independent devices, small scale
    let stats = stress_test_remote(4, 25, 1).await?;
    stats.print();

    // Test 2: tabs on one device sharing a connection
    let stats = stress_test_tabs(4, 25, 2).await?;
    stats.print();

    // Test 3: independent devices, medium scale
    let stats = stress_test_remote(10, 100, 3).await?;
    stats.print();

    // Test 4: scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS (remote sync)                    ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_scaling(12, 4).await?;

    println!("\n✓ All stress tests completed at {}", chrono::Local::now().format("%H:%M:%S"));
    Ok(())
}
