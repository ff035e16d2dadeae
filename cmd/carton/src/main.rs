use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pkg_container::lifecycle::{self, ChildOptions, Limits, RunOptions};
use pkg_container::{exec, inspect};
use pkg_image::ImageStore;

#[derive(Parser)]
#[command(name = "carton", about = "A minimal Linux container runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// One subcommand per launch stage: `run` is the parent, and the hidden
/// variants are what the parent re-execs itself as through
/// `/proc/self/exe`.
#[derive(Subcommand)]
enum Commands {
    /// Launch a container from an image
    Run {
        /// Max RAM to allow in MiB
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        memory: i64,
        /// Max swap to allow in MiB
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        swap: i64,
        /// Number of max processes to allow
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        pids: i64,
        /// Number of CPU cores to restrict to
        #[arg(long, default_value_t = -1.0, allow_negative_numbers = true)]
        cpus: f64,
        /// Image reference, `name[:tag]`
        image: String,
        /// Command to run inside the container
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// List running containers
    Ps,
    /// List local images
    Images,
    /// Run a command inside a running container
    Exec {
        container_id: String,
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Remove an image by its 12-character hash
    Rmi { image_hash: String },
    /// Internal: create and persist the container's network namespace
    #[command(name = "setup-netns", hide = true)]
    SetupNetns { container_id: String },
    /// Internal: move the container veth end into the namespace
    #[command(name = "setup-veth", hide = true)]
    SetupVeth { container_id: String },
    /// Internal: the namespaced container process
    #[command(name = "child-mode", hide = true)]
    ChildMode {
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        memory: i64,
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        swap: i64,
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        pids: i64,
        #[arg(long, default_value_t = -1.0, allow_negative_numbers = true)]
        cpus: f64,
        /// Image hash resolved by the parent
        #[arg(long)]
        image: String,
        container_id: String,
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Tables go to stdout; all logging stays on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::level_filters::LevelFilter::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // We chroot, mount, and write under /var/lib; nothing works unrooted.
    if unsafe { libc::geteuid() } != 0 {
        bail!("You need root privileges to run this program.");
    }

    init_runtime_dirs()?;
    let store = ImageStore::open();

    match cli.command {
        Commands::Run {
            memory,
            swap,
            pids,
            cpus,
            image,
            command,
        } => {
            lifecycle::run(
                &store,
                RunOptions {
                    image,
                    limits: Limits {
                        memory_mib: memory,
                        swap_mib: swap,
                        pids_max: pids,
                        cpus,
                    },
                    command,
                },
            )
            .await
        }
        Commands::Ps => {
            println!("CONTAINER ID\tIMAGE\t\tCOMMAND");
            for container in inspect::running_containers(&store)? {
                println!(
                    "{}\t{}\t{}",
                    container.id, container.image, container.command
                );
            }
            Ok(())
        }
        Commands::Images => {
            println!("IMAGE\t     TAG\t ID");
            for (name, tag, hash) in store.list()? {
                println!("{}\t {:>10}\t {}", name, tag, hash);
            }
            Ok(())
        }
        Commands::Exec {
            container_id,
            command,
        } => exec::exec_in_container(&container_id, &command, &store),
        Commands::Rmi { image_hash } => {
            let running = inspect::running_containers(&store)?;
            store.remove(&image_hash, |image| {
                running
                    .iter()
                    .find(|c| c.image == image)
                    .map(|c| c.id.clone())
            })
        }
        Commands::SetupNetns { container_id } => pkg_network::create_namespace(&container_id),
        Commands::SetupVeth { container_id } => pkg_network::attach_veth(&container_id).await,
        Commands::ChildMode {
            memory,
            swap,
            pids,
            cpus,
            image,
            container_id,
            command,
        } => {
            lifecycle::child_stage(
                &store,
                ChildOptions {
                    container_id,
                    image_hash: image,
                    limits: Limits {
                        memory_mib: memory,
                        swap_mib: swap,
                        pids_max: pids,
                        cpus,
                    },
                    command,
                },
            )
            .await
        }
    }
}

/// Create the directories every command relies on.
fn init_runtime_dirs() -> Result<()> {
    for dir in [
        pkg_constants::paths::LIB_DIR,
        pkg_constants::paths::TMP_DIR,
        pkg_constants::paths::IMAGES_DIR,
        pkg_constants::paths::CONTAINERS_DIR,
    ] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Unable to create requisite directory {}", dir))?;
    }
    Ok(())
}
