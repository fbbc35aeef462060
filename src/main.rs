// Copyright (c) 2020 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::io::Write;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info};

use machine::{Machine, MachineHooks};
use machine_manager::{
    cmdline::{create_vmconfig, Cmdline},
    config::VmConfig,
    machine::MachineExternalInterface,
    qmp::{
        qmp_socket::{QmpContext, QuitNotifier, Socket},
        QmpChannel,
    },
    signal_handler::{exit_with_code, register_kill_signal, VM_EXIT_GENE_ERR, VM_EXIT_SUCCESS},
    temp_cleaner::TempCleaner,
};
use util::logger;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(ref e) => {
            write!(&mut std::io::stderr(), "{}", format_args!("{:?}\r\n", e))
                .expect("Error writing to stderr");

            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cmd_args = Cmdline::parse();
    let vm_config: VmConfig = create_vmconfig(&cmd_args)?;

    logger::init_log(vm_config.log_file.clone().unwrap_or_default())
        .with_context(|| "Failed to init logger.")?;

    std::panic::set_hook(Box::new(|panic_msg| {
        let panic_file = panic_msg.location().map_or("", |loc| loc.file());
        let panic_line = panic_msg.location().map_or(0, |loc| loc.line());
        if let Some(msg) = panic_msg.payload().downcast_ref::<&str>() {
            error!("Panic at [{}: {}]: {}.", panic_file, panic_line, msg);
        } else {
            error!("Panic at [{}: {}].", panic_file, panic_line);
        }

        // clean temporary file
        TempCleaner::clean();
        exit_with_code(VM_EXIT_GENE_ERR);
    }));

    info!("VmConfig is {:?}", vm_config);

    match real_main(&vm_config) {
        Ok(()) => {
            info!("MainLoop over, Vm exit");
            // clean temporary file
            TempCleaner::clean();
        }
        Err(e) => {
            error!("{:?}", e);
            // clean temporary file
            TempCleaner::clean();
            return Err(e);
        }
    }

    Ok(())
}

fn real_main(vm_config: &VmConfig) -> Result<()> {
    let channel = QmpChannel::new();
    register_kill_signal(channel.clone())?;

    let mut machine = Machine::new(vm_config, channel.clone(), MachineHooks::from_config(vm_config))
        .with_context(|| "Failed to init machine.")?;
    machine
        .run(vm_config.freeze_cpu)
        .with_context(|| "Failed to start VM.")?;
    let vm: Arc<Mutex<dyn MachineExternalInterface>> = Arc::new(Mutex::new(machine));

    let quit_notifier: Arc<QuitNotifier> = Arc::new(|| {
        info!("Vm exit by qmp quit");
        TempCleaner::clean();
        exit_with_code(VM_EXIT_SUCCESS);
    });

    let mut listeners = Vec::new();
    for qmp in vm_config.qmp.iter() {
        let mut ctx = QmpContext::new(vm.clone(), channel.clone());
        ctx.rate_limit = vm_config.qmp_rate_limit;
        ctx.unplug_timeout = vm_config.unplug_timeout();
        ctx.quit_notifier = Some(quit_notifier.clone());

        let socket = Socket::bind(&qmp.path, ctx)
            .with_context(|| format!("Failed to bind qmp socket {}", qmp.path))?;
        info!("Qmp socket {} is listening", qmp.path);
        listeners.push(socket.serve()?);
    }

    for listener in listeners {
        listener
            .join()
            .map_err(|_| anyhow!("Qmp listener exits unexpectedly"))?;
    }
    Ok(())
}
