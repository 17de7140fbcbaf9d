//! Walkthrough of the scheduling pipeline on a small DMA/compute graph.
//!
//! Two DMA loads feed a compute invocation whose result is drained by a
//! vector store. Run with: cargo run --example simple_chain
//! (RUST_LOG=debug shows the sweep binding and retiring slots.)

use syncplan::{schedule, SchedulerConfig, TaskGraph, TaskKind};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let config = SchedulerConfig::load();
    println!(
        "scheduling onto {} physical barriers (wlm: {})",
        config.physical_barriers, config.wlm
    );
    println!();

    let mut graph = TaskGraph::new();
    let ifm_ready = graph.add_barrier();
    let wgt_ready = graph.add_barrier();
    let ofm_ready = graph.add_barrier();

    // Queue 0: input-feature DMA. Queue 1: weight DMA.
    graph.push_task(0, TaskKind::DmaCopy, 1, &[], &[ifm_ready])?;
    graph.push_task(1, TaskKind::DmaCopy, 1, &[], &[wgt_ready])?;
    // Queue 2: compute waits for both transfers (legalized into a join),
    // then queue 3 stores the result.
    graph.push_task(2, TaskKind::Compute, 4, &[ifm_ready, wgt_ready], &[ofm_ready])?;
    graph.push_task(3, TaskKind::Vector, 4, &[ofm_ready], &[])?;

    let sched = schedule(&mut graph, &config)?;
    sched.print_summary();
    Ok(())
}
