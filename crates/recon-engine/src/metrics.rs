//! Run metrics, via the plain `metrics` crate directly (spec §4.8): the
//! teacher wraps this crate in a workspace-internal `define_metrics!` macro
//! that has no equivalent outside that workspace, so these are registered
//! and recorded directly instead.

use metrics::{counter, describe_counter, describe_gauge, gauge};

pub fn describe() {
    describe_counter!("recon_applied_tx_total", "Transactions applied to the overlay.");
    describe_counter!("recon_repeat_total", "Transactions re-queued after stale-read validation.");
    describe_counter!("recon_checkpoint_total", "Checkpoints executed.");
    describe_gauge!("recon_output_block_number", "Highest block number whose tasks have all been applied.");
    describe_gauge!("recon_size_estimate", "Current overlay size estimate in bytes.");
}

pub fn record_applied() {
    counter!("recon_applied_tx_total").increment(1);
}

pub fn record_repeat() {
    counter!("recon_repeat_total").increment(1);
}

pub fn record_checkpoint() {
    counter!("recon_checkpoint_total").increment(1);
}

pub fn record_output_block_number(block_num: u64) {
    gauge!("recon_output_block_number").set(block_num as f64);
}

pub fn record_size_estimate(bytes: usize) {
    gauge!("recon_size_estimate").set(bytes as f64);
}
