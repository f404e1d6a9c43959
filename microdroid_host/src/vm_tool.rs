// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command lines for the device's `vm` tool.

/// Size of a freshly created instance image.
pub const INSTANCE_IMAGE_SIZE: u64 = 10 * crate::SIZE_1_MB;

/// Debug level of a VM started with `run-app`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugLevel {
    /// No debugging; the guest is not reachable over adb.
    None,
    /// Full debugging.
    #[default]
    Full,
}

impl DebugLevel {
    /// The `--debug` argument value.
    pub fn as_str(&self) -> &'static str {
        match self {
            DebugLevel::None => "none",
            DebugLevel::Full => "full",
        }
    }
}

/// vCPU topology of a VM started with `run-app`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuTopology {
    /// One vCPU.
    OneCpu,
    /// As many vCPUs as the host has CPUs.
    #[default]
    MatchHost,
}

impl CpuTopology {
    /// The `--cpu-topology` argument value.
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuTopology::OneCpu => "one_cpu",
            CpuTopology::MatchHost => "match_host",
        }
    }
}

/// Arguments of `vm run-app`.
#[derive(Debug, Clone, Default)]
pub struct RunAppArgs {
    /// Device path of the payload APK.
    pub apk: String,
    /// Device path of the APK signature.
    pub idsig: String,
    /// Device path of the instance image.
    pub instance_image: String,
    /// Debug level.
    pub debug: DebugLevel,
    /// Console output file.
    pub console: Option<String>,
    /// Log output file.
    pub log: Option<String>,
    /// Guest memory.
    pub memory_mib: Option<u32>,
    /// vCPU topology.
    pub cpu_topology: Option<CpuTopology>,
    /// Whether the VM is protected.
    pub protected: bool,
    /// GKI version to boot instead of the Microdroid kernel.
    pub gki: Option<String>,
    /// VM name.
    pub name: Option<String>,
    /// Device-tree labels of devices to assign.
    pub devices: Vec<String>,
    /// Whether to back guest memory with huge pages.
    pub hugepages: bool,
    /// Payload binary inside the APK.
    pub payload_binary_name: Option<String>,
    /// VM config path inside the APK.
    pub config_path: Option<String>,
    /// Instance id file, for devices with per-instance ids.
    pub instance_id_file: Option<String>,
}

/// The `vm` tool at a device path.
#[derive(Debug, Clone)]
pub struct VmTool {
    path: String,
}

impl Default for VmTool {
    fn default() -> Self {
        Self {
            path: format!("{}bin/vm", crate::VIRT_APEX),
        }
    }
}

impl VmTool {
    /// Uses the tool at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    fn command(&self, subcommand: &str) -> Vec<String> {
        vec![self.path.clone(), subcommand.to_owned()]
    }

    /// `vm create-idsig <apk> <out>`.
    pub fn create_idsig(&self, apk: &str, out: &str) -> Vec<String> {
        let mut cmd = self.command("create-idsig");
        cmd.extend([apk.to_owned(), out.to_owned()]);
        cmd
    }

    /// `vm create-partition --type instance <out> <size>`.
    pub fn create_instance_partition(&self, out: &str, size: u64) -> Vec<String> {
        let mut cmd = self.command("create-partition");
        cmd.extend([
            "--type".to_owned(),
            "instance".to_owned(),
            out.to_owned(),
            size.to_string(),
        ]);
        cmd
    }

    /// `vm run --console <console> --log <log> <config>`.
    pub fn run(&self, config: &str, console: &str, log: &str) -> Vec<String> {
        let mut cmd = self.command("run");
        cmd.extend(
            ["--console", console, "--log", log, config]
                .into_iter()
                .map(str::to_owned),
        );
        cmd
    }

    /// `vm run-app [options] <apk> <idsig> <instance image>`.
    pub fn run_app(&self, args: &RunAppArgs) -> Vec<String> {
        let mut cmd = self.command("run-app");
        let mut opt = |flag: &str, value: Option<&str>| {
            if let Some(value) = value {
                cmd.push(flag.to_owned());
                cmd.push(value.to_owned());
            }
        };
        opt("--console", args.console.as_deref());
        opt("--log", args.log.as_deref());
        opt("--debug", Some(args.debug.as_str()));
        let mem = args.memory_mib.map(|m| m.to_string());
        opt("--mem", mem.as_deref());
        opt("--cpu-topology", args.cpu_topology.map(|t| t.as_str()));
        opt("--gki", args.gki.as_deref());
        opt("--name", args.name.as_deref());
        let devices = (!args.devices.is_empty()).then(|| args.devices.join(","));
        opt("--devices", devices.as_deref());
        opt("--payload-binary-name", args.payload_binary_name.as_deref());
        opt("--config-path", args.config_path.as_deref());
        opt("--instance-id-file", args.instance_id_file.as_deref());
        if args.protected {
            cmd.push("--protected".to_owned());
        }
        if args.hugepages {
            cmd.push("--hugepages".to_owned());
        }
        cmd.extend([
            args.apk.clone(),
            args.idsig.clone(),
            args.instance_image.clone(),
        ]);
        cmd
    }

    /// `vm list`.
    pub fn list(&self) -> Vec<String> {
        self.command("list")
    }

    /// `vm info`.
    pub fn info(&self) -> Vec<String> {
        self.command("info")
    }

    /// `vm check-feature-enabled <feature>`.
    pub fn check_feature_enabled(&self, feature: &str) -> Vec<String> {
        let mut cmd = self.command("check-feature-enabled");
        cmd.push(feature.to_owned());
        cmd
    }
}

/// Joins an argument vector into a device shell command line.
pub fn shell_line(args: &[String]) -> String {
    shell_words::join(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_partition() {
        assert_eq!(
            VmTool::default().create_instance_partition("/data/local/tmp/virt/instance.img", INSTANCE_IMAGE_SIZE),
            [
                "/apex/com.android.virt/bin/vm",
                "create-partition",
                "--type",
                "instance",
                "/data/local/tmp/virt/instance.img",
                "10485760",
            ]
        );
    }

    #[test]
    fn raw_run() {
        assert_eq!(
            VmTool::new("vm").run("/cfg.json", "/console.txt", "/log.txt"),
            ["vm", "run", "--console", "/console.txt", "--log", "/log.txt", "/cfg.json"]
        );
    }

    #[test]
    fn minimal_run_app() {
        let args = RunAppArgs {
            apk: "/data/app/test.apk".into(),
            idsig: "/data/local/tmp/virt/idsig".into(),
            instance_image: "/data/local/tmp/virt/instance.img".into(),
            debug: DebugLevel::None,
            ..Default::default()
        };
        assert_eq!(
            VmTool::new("vm").run_app(&args),
            [
                "vm",
                "run-app",
                "--debug",
                "none",
                "/data/app/test.apk",
                "/data/local/tmp/virt/idsig",
                "/data/local/tmp/virt/instance.img",
            ]
        );
    }

    #[test]
    fn full_run_app() {
        let args = RunAppArgs {
            apk: "a.apk".into(),
            idsig: "idsig".into(),
            instance_image: "instance.img".into(),
            debug: DebugLevel::Full,
            console: Some("/c".into()),
            log: Some("/l".into()),
            memory_mib: Some(170),
            cpu_topology: Some(CpuTopology::MatchHost),
            protected: true,
            gki: Some("android14-6.1".into()),
            name: Some("test_vm".into()),
            devices: vec!["/__symbols__/a".into(), "/__symbols__/b".into()],
            hugepages: true,
            payload_binary_name: Some("MicrodroidCrashNativeLib.so".into()),
            config_path: Some("assets/vm_config_crash.json".into()),
            instance_id_file: Some("instance_id".into()),
        };
        let cmd = VmTool::new("vm").run_app(&args);
        let line = cmd.join(" ");
        assert_eq!(
            line,
            "vm run-app --console /c --log /l --debug full --mem 170 \
             --cpu-topology match_host --gki android14-6.1 --name test_vm \
             --devices /__symbols__/a,/__symbols__/b \
             --payload-binary-name MicrodroidCrashNativeLib.so \
             --config-path assets/vm_config_crash.json \
             --instance-id-file instance_id --protected --hugepages \
             a.apk idsig instance.img"
        );
    }
}
