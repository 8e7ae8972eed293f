use std::{fs, path::PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use client::{ClientConfig, RemoteClient};

/// Command line front end for the dispatch system.
#[derive(Debug, Parser)]
#[command(name = "sim-client")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// List machines known to a directory server.
    Machines {
        #[arg(long)]
        directory: String,
    },
    /// Show a dispatch server's slot status.
    Status {
        #[arg(long)]
        server: String,
    },
    /// Run a model to completion on a dispatch server.
    Run {
        #[arg(long)]
        server: String,
        /// Model description file.
        #[arg(long)]
        model: PathBuf,
        #[arg(long, default_value_t = 1)]
        threads: u32,
        #[arg(long, default_value = "anonymous")]
        user: String,
        /// Result variable filter; `*` fetches everything.
        #[arg(long, default_value = "*")]
        results: String,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let client = RemoteClient::new(ClientConfig::default())?;

    match args.cmd {
        Cmd::Machines { directory } => {
            client.connect_to_directory(&directory)?;
            let machines = client.request_server_machines(100, 1e9)?;
            for m in &machines {
                println!("{}\t{} slots\t{}", m.address, m.num_slots, m.description);
            }
            client.disconnect();
        }
        Cmd::Status { server } => {
            client.connect_to_server(&server)?;
            let status = client.request_server_status()?;
            println!(
                "{}/{} slots free, users: {}",
                status.free_slots,
                status.total_slots,
                status.users.join(", ")
            );
            client.disconnect();
        }
        Cmd::Run {
            server,
            model,
            threads,
            user,
            results,
        } => {
            let model_text = fs::read_to_string(&model)
                .with_context(|| format!("could not read {}", model.display()))?;
            let (host, port) = server
                .rsplit_once(':')
                .context("server address must be host:port")?;
            let port: u16 = port.parse().context("bad server port")?;

            client.connect_to_server(&server)?;
            let offset = client.request_slot(threads, &user)?;
            client.connect_to_worker(&format!("{host}:{}", port + offset))?;

            client.identify_user(&user, "")?;
            client.set_model(&model_text)?;
            let ok = client.blocking_simulation()?;

            for msg in client.request_messages()? {
                eprintln!("[{}] {}: {}", msg.kind, msg.tag, msg.text);
            }
            if !ok {
                client.disconnect();
                bail!("simulation failed");
            }

            for variable in client.request_results(&results)? {
                let last = variable.data.last().copied().unwrap_or(f64::NAN);
                println!("{}\t{} samples\tfinal = {last}", variable.name, variable.data.len());
            }
            client.disconnect();
        }
    }

    Ok(())
}
