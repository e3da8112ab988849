use clap::Parser;

use fabric_core::topology::{build_vl2, Topology, Vl2Params};
use fabric_replay::adapters::{BulkTransferTool, FakeBulkTransferTool, NullEmulatorDriver, ProcessBulkTransferTool};
use fabric_replay::cli::{Args, ExitCode};

fn main() {
    env_logger::init();
    let args = Args::parse();

    let (nodes, links) = build_vl2(Vl2Params { d_a: 4, d_i: 4 });
    let topology = match Topology::new(&nodes, &links) {
        Ok(t) => t,
        Err(e) => {
            log::error!("default topology is invalid: {e}");
            std::process::exit(ExitCode::TraceLoadError as i32);
        }
    };

    let mut emulator = NullEmulatorDriver::default();
    let fake_tool;
    let process_tool;
    let tool: &dyn BulkTransferTool = match &args.bulk_transfer_binary {
        Some(binary) => {
            process_tool = ProcessBulkTransferTool::new(binary, args.bulk_transfer_args.clone());
            &process_tool
        }
        None => {
            fake_tool = FakeBulkTransferTool::default();
            &fake_tool
        }
    };

    match fabric_replay::run(&args, &topology, &mut emulator, tool) {
        Ok(summary) => {
            log::info!(
                "replay finished: {} flows started, {} skipped",
                summary.flows_started,
                summary.total_skipped()
            );
            std::process::exit(ExitCode::Success as i32);
        }
        Err(e) => {
            log::error!("{e}");
            std::process::exit(e.exit_code() as i32);
        }
    }
}
