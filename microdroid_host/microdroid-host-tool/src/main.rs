// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tool for using microdroid_host functionality from the command line.

use anyhow::Context as _;
use clap::Parser;
use microdroid_host::Device;
use microdroid_host::Settings;
use microdroid_host::avb::AvbTools;
use microdroid_host::config::payload_components;
use microdroid_host::config::staged_raw_config;
use microdroid_host::inventory::Inventory;
use microdroid_host::payload_metadata;
use microdroid_host::resign::ResignRequest;
use microdroid_host::telemetry::LifecycleExpectation;
use microdroid_host::statsd;
use microdroid_host::telemetry::validate_lifecycle;
use microdroid_host::test::ScenarioParams;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Command line interface for inspecting devices and staging Microdroid VMs.
#[derive(Parser)]
struct CliArgs {
    #[clap(flatten)]
    settings: Settings,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Lists the active components of the device.
    Inventory,

    /// Builds the raw VM configuration a resigned-image boot uses.
    ///
    /// Paths point at the test root, where the resigned images are staged.
    RawConfig {
        /// Device path of the payload APK.
        #[clap(long)]
        apk: String,
        /// Builds a protected VM configuration.
        #[clap(long)]
        protected: bool,
        /// Boots this GKI version instead of the Microdroid kernel.
        #[clap(long)]
        gki: Option<String>,
        /// Writes the configuration here instead of stdout.
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Resigns a pulled virtualization APEX `etc/` tree in place.
    Resign {
        /// Directory holding the `etc/` tree.
        dir: PathBuf,
        /// Signing key for every image without an override.
        #[clap(long)]
        key: PathBuf,
        /// Per-image key, as `<image file name>=<key path>`.
        #[clap(long = "key-override", value_parser = parse_key_override)]
        key_overrides: Vec<(String, PathBuf)>,
        /// Leaves the vbmeta digests in the bootconfigs untouched.
        #[clap(long)]
        no_update_bootconfigs: bool,
    },

    /// Checks that the vbmeta images under an `etc/` tree use SHA-256 only.
    CheckAvb {
        /// Directory holding the `etc/` tree.
        etc_dir: PathBuf,
    },

    /// Writes a payload metadata image.
    PayloadMetadata {
        /// Path to the output image.
        output: PathBuf,
        /// VM config path inside the guest.
        #[clap(long, default_value = payload_metadata::DEFAULT_CONFIG_PATH)]
        config_path: String,
        /// APEX carried by the payload disk. May be repeated.
        #[clap(long = "apex")]
        apexes: Vec<String>,
    },

    /// Prints a payload metadata image.
    DecodeMetadata {
        /// Path to the image.
        image: PathBuf,
    },

    /// Validates one VM's lifecycle in a statsd report.
    CheckTelemetry {
        /// Output of `cmd stats dump-report <id> --proto`.
        report: PathBuf,
        /// Expected VM name.
        #[clap(long)]
        vm_name: String,
        /// The VM was protected.
        #[clap(long)]
        protected: bool,
        /// Expected vCPU count.
        #[clap(long)]
        num_cpus: u32,
        /// Expected guest memory.
        #[clap(long)]
        memory_mib: u32,
        /// Expected requested APEXes, colon separated.
        #[clap(long)]
        apexes: Option<String>,
        /// The VM ran on pKVM, so the hypervisor and guest CPU time are
        /// reported.
        #[clap(long)]
        pkvm: bool,
    },
}

fn parse_key_override(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((image, key)) if !image.is_empty() && !key.is_empty() => {
            Ok((image.to_owned(), key.into()))
        }
        _ => Err(format!("expected <image>=<key>, got {value:?}")),
    }
}

fn init_logging() -> anyhow::Result<()> {
    let targets = match std::env::var("MICRODROID_LOG") {
        Ok(var) => var
            .parse::<Targets>()
            .with_context(|| format!("invalid MICRODROID_LOG value {var:?}"))?,
        Err(_) => Targets::new().with_default(LevelFilter::INFO),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(targets)
        .try_init()
        .context("failed to initialize logging")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging()?;
    let args = CliArgs::parse();
    let settings = args.settings;
    match args.command {
        Command::Inventory => {
            let device = settings.connect()?;
            let inventory = Inventory::pull(&device)?;
            for component in inventory.components() {
                println!(
                    "{}\t{}{}",
                    component.name,
                    component.path,
                    if component.provides_shared_libraries {
                        "\tshared-libs"
                    } else {
                        ""
                    }
                );
            }
        }
        Command::RawConfig {
            apk,
            protected,
            gki,
            output,
        } => {
            let device = settings.connect()?;
            let config = raw_config(&device, apk, protected, gki)?;
            match output {
                Some(path) => fs_err::write(path, config)?,
                None => println!("{config}"),
            }
        }
        Command::Resign {
            dir,
            key,
            key_overrides,
            no_update_bootconfigs,
        } => {
            let mut request =
                ResignRequest::new(settings.find_test_file("sign_virt_apex")?, dir, key);
            request.key_overrides = key_overrides.into_iter().collect::<BTreeMap<_, _>>();
            request.update_bootconfigs = !no_update_bootconfigs;
            microdroid_host::resign::resign(&request).context("failed to resign images")?;
            tracing::info!(dir = %request.working_dir.display(), "images resigned");
        }
        Command::CheckAvb { etc_dir } => {
            let tools = AvbTools {
                lz4: settings.find_test_file("lz4")?,
                avbtool: settings.find_test_file("avbtool")?,
            };
            tools.check_vbmeta_sha256(&etc_dir)?;
            println!("all vbmeta images use sha256");
        }
        Command::PayloadMetadata {
            output,
            config_path,
            apexes,
        } => {
            let metadata =
                payload_metadata::payload_metadata(&config_path, apexes.iter().map(String::as_str));
            payload_metadata::write(&metadata, &output)?;
        }
        Command::DecodeMetadata { image } => {
            let metadata = payload_metadata::decode_framed(&fs_err::read(&image)?)
                .with_context(|| format!("failed to decode {}", image.display()))?;
            println!("version: {}", metadata.version);
            if let Some(config_path) = &metadata.config_path {
                println!("config: {config_path}");
            }
            for apex in &metadata.apexes {
                println!("apex: {} ({})", apex.name, apex.partition_name);
            }
            if let Some(apk) = &metadata.apk {
                println!(
                    "apk: {} ({}, {})",
                    apk.name, apk.payload_partition_name, apk.idsig_partition_name
                );
            }
        }
        Command::CheckTelemetry {
            report,
            vm_name,
            protected,
            num_cpus,
            memory_mib,
            apexes,
            pkvm,
        } => {
            let events = statsd::parse_report(&fs_err::read(report)?)?;
            let events: Vec<_> = events
                .into_iter()
                .filter(|event| event.vm_identifier() == vm_name)
                .collect();
            let lifecycle = validate_lifecycle(&events)?;
            LifecycleExpectation {
                vm_identifier: vm_name,
                protected,
                num_cpus,
                memory_mib,
                apexes,
                pkvm,
            }
            .check(&lifecycle)?;
            println!(
                "vm booted after {} ms and exited after {} ms ({:?})",
                lifecycle.booted.elapsed_time_millis,
                lifecycle.exited.elapsed_time_millis,
                lifecycle.exited.death_reason
            );
        }
    }
    Ok(())
}

fn raw_config(
    device: &dyn Device,
    apk_path: String,
    protected: bool,
    gki: Option<String>,
) -> anyhow::Result<String> {
    let os = ScenarioParams { protected, gki }.os();
    let template = device
        .pull_file_contents(&format!("{}etc/{os}.json", microdroid_host::VIRT_APEX))
        .with_context(|| format!("failed to read the {os} template"))?;
    let inventory = Inventory::pull(device)?;
    let config = staged_raw_config(
        &template,
        &os,
        payload_components(&inventory)?,
        apk_path,
        protected,
    )?;
    Ok(config.to_json()?)
}
