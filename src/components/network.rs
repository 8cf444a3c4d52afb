//! Resolves the VM-level network interface descriptions into concrete tap
//! devices, guest MAC/IP configuration and kernel boot parameters. Static
//! interfaces are passed through after validation; CNI interfaces run the
//! configured plugin chain and are rewritten in place into static ones so
//! downstream handlers see a uniform shape.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    process::Stdio,
};

use cni_plugin::reply::SuccessReply;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::model::{
    kernel_args::KernelArgs, network_interface::NetworkInterface, rate_limiter::RateLimiter,
};
use crate::utils::DEFAULT_NETNS_DIR;

pub const DEFAULT_CNI_BIN_DIR: &'static str = "/opt/cni/bin";
pub const DEFAULT_CNI_CONF_DIR: &'static str = "/etc/cni/conf.d";
pub const DEFAULT_CNI_CACHE_DIR: &'static str = "/var/lib/cni";

#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("configuration error in network interface setting, reason: {0}")]
    Configuration(String),

    #[error("validation failed, reason: {0}")]
    Validation(String),

    #[error("CNI invocation failed, reason: {0}")]
    Cni(String),

    #[error("network namespace error, reason: {0}")]
    Netns(String),
}

/// The set of network interfaces a VM will be configured to use.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmNetworkInterfaces(pub Vec<VmNetworkInterface>);

/// One VM network interface, configured either with static parameters or via
/// CNI. Specifying both on the same interface is an error.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmNetworkInterface {
    /// Static parameters used to configure the VM's tap device and internal
    /// network for this interface.
    pub static_configuration: Option<StaticNetworkConfiguration>,

    /// CNI parameters used to generate the VM's network namespace, tap
    /// device and internal network for this interface.
    pub cni_configuration: Option<CNIConfiguration>,

    /// Makes the firecracker MMDS available on this network interface.
    pub allow_mmds: Option<bool>,

    /// Limits the incoming bytes.
    pub in_rate_limiter: Option<RateLimiter>,

    /// Limits the outgoing bytes.
    pub out_rate_limiter: Option<RateLimiter>,
}

/// Static tap + guest addressing for one interface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StaticNetworkConfiguration {
    /// MAC address assigned to the network interface inside the microVM.
    pub mac_address: String,

    /// Name of the host tap device the VM will use.
    pub host_dev_name: String,

    /// Optional static IP, gateway and up to 2 DNS nameservers configured
    /// within the VM upon startup via the kernel's ip= boot parameter.
    pub ip_configuration: Option<IPConfiguration>,
}

/// An IP, gateway and nameservers applied to the VM's internal interface at
/// boot through the kernel IP autoconfiguration string. IPv4 only.
///
/// The first two nameservers end up in /proc/net/pnp in a format compatible
/// with /etc/resolv.conf; guests that want them typically symlink
/// /etc/resolv.conf to /proc/net/pnp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPConfiguration {
    pub ip_addr: Ipv4Addr,
    pub ip_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub nameservers: Vec<String>,
    pub if_name: String,
}

/// CNI parameters for generating the network namespace and tap device used
/// by a firecracker interface. Only a single CNI interface per VM is
/// supported.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CNIConfiguration {
    /// Selects the name of the network whose configuration list will be
    /// loaded from `conf_dir` when invoking CNI. Either `network_name` or
    /// `network_config` is required.
    pub network_name: Option<String>,

    /// A parsed network configuration list, taking the place of the
    /// `network_name` lookup in `conf_dir`.
    pub network_config: Option<Value>,

    /// CNI_IFNAME, the name of the interface created by the plugin chain
    /// inside the netns.
    pub if_name: Option<String>,

    /// Interface name inside the VM. Used to correctly pass IP
    /// configuration obtained from CNI to the VM kernel. May be left blank
    /// for VMs with a single network interface.
    pub vm_if_name: Option<String>,

    /// CNI_ARGS key/value pairs passed to the plugins.
    pub args: Option<Vec<(String, String)>>,

    /// Directory CNI plugin binaries are sought in. Defaults to
    /// /opt/cni/bin.
    pub bin_path: Option<PathBuf>,

    /// Directory network configuration lists are sought in. Defaults to
    /// /etc/cni/conf.d.
    pub conf_dir: Option<PathBuf>,

    /// Directory CNI results are cached in between ADD and DEL. Defaults to
    /// /var/lib/cni/<container id>.
    pub cache_dir: Option<PathBuf>,

    /// CNI_CONTAINERID. Filled from the machine's VMID.
    #[serde(default)]
    pub container_id: String,

    /// Path of the network namespace handle. Filled from the machine
    /// configuration.
    #[serde(default)]
    pub net_ns_path: Option<PathBuf>,

    /// When set, a failure to delete a pre-existing network is logged but
    /// does not abort setup.
    #[serde(default)]
    pub force: bool,

    #[serde(default)]
    owns_netns: bool,
}

/// A network configuration list as stored on disk, per the CNI spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetworkConfList {
    #[serde(rename = "cniVersion")]
    cni_version: String,
    name: String,
    plugins: Vec<Value>,
}

impl VmNetworkInterfaces {
    /// Applies the cross-interface invariants: every interface must pick
    /// exactly one of static/CNI, at most one interface may carry an IP
    /// configuration, a CNI interface must be the only interface, and an IP
    /// configuration clashes with a user-supplied ip= boot parameter.
    pub fn validate(&self, kernel_args: &KernelArgs) -> Result<(), NetworkError> {
        for iface in &self.0 {
            let has_cni = iface.cni_configuration.is_some();
            let has_static_interface = iface.static_configuration.is_some();
            let has_static_ip = iface
                .static_configuration
                .as_ref()
                .map(|s| s.ip_configuration.is_some())
                .unwrap_or(false);

            if !has_cni && !has_static_interface {
                return Err(NetworkError::Configuration(
                    "must specify at least one of CNIConfiguration or StaticNetworkConfiguration"
                        .to_string(),
                ));
            }

            if has_cni && has_static_interface {
                return Err(NetworkError::Configuration(
                    "cannot specify both CNIConfiguration and StaticNetworkConfiguration on one interface"
                        .to_string(),
                ));
            }

            // the "ip=" kernel boot param can only describe a single
            // interface, so at most one interface may want it
            if has_cni || has_static_ip {
                if self.0.len() > 1 {
                    return Err(NetworkError::Configuration(format!(
                        "cannot specify CNIConfiguration or IPConfiguration when multiple network interfaces are provided: {:#?}",
                        self.0
                    )));
                }

                let arg_val = kernel_args.get("ip");
                if let Some(Some(existing)) = arg_val {
                    return Err(NetworkError::Configuration(format!(
                        "CNIConfiguration or IPConfiguration cannot be specified when \"ip=\" is provided in kernel boot args, value found: {}",
                        existing
                    )));
                }
            }

            if let Some(cni) = &iface.cni_configuration {
                cni.validate()?;
            }

            if let Some(static_conf) = &iface.static_configuration {
                static_conf.validate()?;
            }
        }
        Ok(())
    }

    /// Resolves every interface to a static shape, invoking the CNI plugin
    /// chain where requested, and rewrites the kernel args with the ip= boot
    /// parameter when an IP configuration is present.
    pub async fn setup(
        &mut self,
        vmid: &str,
        net_ns_path: &Option<PathBuf>,
        kernel_args: &mut KernelArgs,
    ) -> Result<(), NetworkError> {
        if let Some(idx) = self.cni_interface_index() {
            let iface = &mut self.0[idx];
            if let Some(cni) = iface.cni_configuration.as_mut() {
                cni.container_id = vmid.to_string();
                if cni.net_ns_path.is_none() {
                    cni.net_ns_path = net_ns_path.to_owned();
                }
                cni.set_defaults();
                cni.initialize_netns().await?;

                let result = cni.invoke_add().await?;
                iface.static_configuration = Some(static_configuration_from_cni(cni, &result)?);
            }
        }

        if let Some(static_ip) = self.static_ip_configuration() {
            kernel_args.remove("ip");
            kernel_args.insert("ip", Some(static_ip.ip_boot_param()));
        }

        Ok(())
    }

    /// Reverses the CNI plugin chain for the interface that ran it. Errors
    /// are returned so the caller can decide whether they mask an earlier
    /// failure.
    pub async fn teardown(&mut self) -> Result<(), NetworkError> {
        if let Some(idx) = self.cni_interface_index() {
            if let Some(cni) = self.0[idx].cni_configuration.as_mut() {
                cni.invoke_del().await?;
                cni.cleanup_netns()?;
            }
        }
        Ok(())
    }

    /// Lowers the resolved interfaces to their wire representation. CNI
    /// interfaces must have been resolved by `setup` first.
    pub fn as_wire_interfaces(&self) -> Result<Vec<NetworkInterface>, NetworkError> {
        let mut wire = Vec::with_capacity(self.0.len());
        for (i, iface) in self.0.iter().enumerate() {
            let static_conf = iface.static_configuration.as_ref().ok_or_else(|| {
                NetworkError::Configuration(
                    "network interface has not been resolved to a static configuration".to_string(),
                )
            })?;

            let mut item = NetworkInterface::default()
                .with_iface_id((i + 1).to_string())
                .with_host_dev_name(static_conf.host_dev_name.to_owned())
                .with_guest_mac(static_conf.mac_address.to_owned());
            if let Some(allow) = iface.allow_mmds {
                item = item.set_allow_mmds_requests(allow);
            }
            item.rx_rate_limiter = iface.in_rate_limiter.to_owned();
            item.tx_rate_limiter = iface.out_rate_limiter.to_owned();
            wire.push(item);
        }
        Ok(wire)
    }

    /// Interface ids (wire side) of every interface that allows MMDS.
    pub fn mmds_iface_ids(&self) -> Vec<String> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, iface)| iface.allow_mmds.unwrap_or(false))
            .map(|(i, _)| (i + 1).to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    fn cni_interface_index(&self) -> Option<usize> {
        self.0.iter().position(|i| i.cni_configuration.is_some())
    }

    /// The single IP configuration of the list, if any. Validation
    /// guarantees there is at most one.
    fn static_ip_configuration(&self) -> Option<&IPConfiguration> {
        self.0
            .iter()
            .filter_map(|i| i.static_configuration.as_ref())
            .filter_map(|s| s.ip_configuration.as_ref())
            .next()
    }
}

impl StaticNetworkConfiguration {
    pub(crate) fn validate(&self) -> Result<(), NetworkError> {
        if self.host_dev_name.is_empty() {
            return Err(NetworkError::Validation(format!(
                "host_dev_name must be provided if StaticNetworkConfiguration is provided, {:#?}",
                self
            )));
        }

        if !is_valid_mac(&self.mac_address) {
            return Err(NetworkError::Validation(format!(
                "invalid MAC address: {}",
                self.mac_address
            )));
        }

        if let Some(ip_configuration) = &self.ip_configuration {
            ip_configuration.validate()?;
        }

        Ok(())
    }
}

fn is_valid_mac(mac: &str) -> bool {
    let groups: Vec<&str> = mac.split(':').collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
}

impl IPConfiguration {
    pub(crate) fn validate(&self) -> Result<(), NetworkError> {
        if self.nameservers.len() > 2 {
            return Err(NetworkError::Validation(format!(
                "cannot specify more than 2 nameservers: {:#?}",
                self.nameservers
            )));
        }

        Ok(())
    }

    /// The value for the "ip=" kernel boot parameter matching this
    /// configuration. See the "ip=" section of
    /// Documentation/filesystems/nfs/nfsroot.txt in the kernel tree.
    ///
    /// Not everything survives the trip through "ip=": the MAC and MTU
    /// cannot be applied this way, only the first two nameservers are
    /// carried, and nameservers land in /proc/net/pnp rather than
    /// /etc/resolv.conf.
    pub(crate) fn ip_boot_param(&self) -> String {
        // client-ip is the address assigned to the primary interface
        let client_ip = self.ip_addr.to_string();

        // no nfs server
        const SERVER_IP: &'static str = "";

        let default_gateway = self.gateway.to_string();

        // dotted decimal notation
        let subnet_mask = self.ip_mask.to_string();

        // hostname only matters for DHCP requests
        const DHCP_HOST_NAME: &'static str = "";

        // if blank, the only network device present in the VM is used
        let device = self.if_name.to_owned();

        // no autoconfiguration (DHCP, BOOTP, RARP)
        const AUTO_CONFIGURATION: &'static str = "off";

        let mut nameservers = [""; 2];
        for (i, ns) in self.nameservers.iter().enumerate() {
            if i == 2 {
                break;
            }
            nameservers[i] = ns.as_str();
        }

        const NTP_SERVER: &'static str = "";

        [
            client_ip,
            SERVER_IP.to_string(),
            default_gateway,
            subnet_mask,
            DHCP_HOST_NAME.to_string(),
            device,
            AUTO_CONFIGURATION.to_string(),
            nameservers[0].to_string(),
            nameservers[1].to_string(),
            NTP_SERVER.to_string(),
        ]
        .join(":")
    }
}

impl CNIConfiguration {
    pub(crate) fn validate(&self) -> Result<(), NetworkError> {
        if self.network_name.is_none() && self.network_config.is_none() {
            return Err(NetworkError::Validation(format!(
                "must specify either network_name or network_config in CNIConfiguration: {:#?}",
                self
            )));
        }

        if self.network_name.is_some() && self.network_config.is_some() {
            return Err(NetworkError::Validation(format!(
                "must not specify both network_name and network_config in CNIConfiguration: {:#?}",
                self
            )));
        }

        Ok(())
    }

    pub(crate) fn set_defaults(&mut self) {
        if self.bin_path.is_none() {
            self.bin_path = Some(DEFAULT_CNI_BIN_DIR.into());
        }

        if self.conf_dir.is_none() {
            self.conf_dir = Some(DEFAULT_CNI_CONF_DIR.into());
        }

        if self.cache_dir.is_none() {
            let path: PathBuf = [DEFAULT_CNI_CACHE_DIR, self.container_id.as_str()]
                .iter()
                .collect();
            self.cache_dir = Some(path);
        }

        if self.if_name.is_none() {
            self.if_name = Some("eth0".to_string());
        }
    }

    /// Makes sure the netns exists. A missing handle under the default netns
    /// directory is created, anything else missing is an error.
    pub(crate) async fn initialize_netns(&mut self) -> Result<(), NetworkError> {
        let path = self.net_ns_path.as_ref().ok_or_else(|| {
            NetworkError::Netns("no network namespace path configured".to_string())
        })?;

        if tokio::fs::metadata(path).await.is_ok() {
            debug!(target: "network", "reusing existing netns {}", path.display());
            return Ok(());
        }

        let name = netns_name(path)?;
        if path.parent() != Some(Path::new(DEFAULT_NETNS_DIR)) {
            return Err(NetworkError::Netns(format!(
                "netns handle {} does not exist and is not under {}, refusing to create it",
                path.display(),
                DEFAULT_NETNS_DIR
            )));
        }

        info!(target: "network", "creating netns {}", name);
        let (code, _output, error) = run_script::run_script!(format!("ip netns add {}", name))
            .map_err(|e| NetworkError::Netns(format!("fail to run ip netns add: {}", e)))?;
        if code != 0 {
            return Err(NetworkError::Netns(format!(
                "ip netns add {} exited with {}: {}",
                name, code, error
            )));
        }
        self.owns_netns = true;
        Ok(())
    }

    pub(crate) fn cleanup_netns(&mut self) -> Result<(), NetworkError> {
        if !self.owns_netns {
            return Ok(());
        }
        let path = self.net_ns_path.as_ref().ok_or_else(|| {
            NetworkError::Netns("no network namespace path configured".to_string())
        })?;
        let name = netns_name(path)?;
        let (code, _output, error) = run_script::run_script!(format!("ip netns del {}", name))
            .map_err(|e| NetworkError::Netns(format!("fail to run ip netns del: {}", e)))?;
        if code != 0 {
            return Err(NetworkError::Netns(format!(
                "ip netns del {} exited with {}: {}",
                name, code, error
            )));
        }
        self.owns_netns = false;
        Ok(())
    }

    fn conf_list(&self) -> Result<NetworkConfList, NetworkError> {
        if let Some(network_config) = &self.network_config {
            return serde_json::from_value(network_config.to_owned()).map_err(|e| {
                NetworkError::Configuration(format!("malformed network_config: {}", e))
            });
        }

        let name = self.network_name.as_ref().ok_or_else(|| {
            NetworkError::Configuration(
                "neither network_name nor network_config provided".to_string(),
            )
        })?;
        let path: PathBuf = [
            self.conf_dir
                .to_owned()
                .unwrap_or_else(|| DEFAULT_CNI_CONF_DIR.into()),
            format!("{}.conflist", name).into(),
        ]
        .iter()
        .collect();
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            NetworkError::Configuration(format!(
                "fail to read CNI network config {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            NetworkError::Configuration(format!(
                "malformed CNI network config {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn cached_result_path(&self) -> PathBuf {
        let mut path = self
            .cache_dir
            .to_owned()
            .unwrap_or_else(|| DEFAULT_CNI_CACHE_DIR.into());
        path.push(format!("{}.json", self.container_id));
        path
    }

    /// Runs the plugin chain forward, caching and returning the final reply.
    pub(crate) async fn invoke_add(&self) -> Result<SuccessReply, NetworkError> {
        let conf_list = self.conf_list()?;
        let mut prev_result: Option<Value> = None;

        for plugin in &conf_list.plugins {
            let raw = self
                .exec_plugin("ADD", &conf_list, plugin, prev_result.take())
                .await?;
            prev_result = Some(raw);
        }

        let raw = prev_result.ok_or_else(|| {
            NetworkError::Cni(format!(
                "network {} declares no plugins",
                conf_list.name
            ))
        })?;

        let cache_path = self.cached_result_path();
        if let Some(parent) = cache_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(target: "network", "fail to create CNI cache dir {}: {}", parent.display(), e);
            }
        }
        if let Err(e) = std::fs::write(&cache_path, raw.to_string()) {
            warn!(target: "network", "fail to cache CNI result at {}: {}", cache_path.display(), e);
        }

        serde_json::from_value(raw)
            .map_err(|e| NetworkError::Cni(format!("malformed CNI result: {}", e)))
    }

    /// Runs the plugin chain in reverse with the cached ADD result.
    pub(crate) async fn invoke_del(&self) -> Result<(), NetworkError> {
        let conf_list = self.conf_list()?;
        let cache_path = self.cached_result_path();
        let prev_result: Option<Value> = std::fs::read_to_string(&cache_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());

        for plugin in conf_list.plugins.iter().rev() {
            if let Err(e) = self
                .exec_plugin("DEL", &conf_list, plugin, prev_result.to_owned())
                .await
            {
                if self.force {
                    error!(target: "network", "ignoring CNI DEL failure (force set): {}", e);
                } else {
                    return Err(e);
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&cache_path) {
            debug!(target: "network", "fail to remove CNI cache {}: {}", cache_path.display(), e);
        }

        Ok(())
    }

    /// Executes one plugin of the chain with the configuration on stdin and
    /// the CNI contract in the environment, returning its stdout reply.
    async fn exec_plugin(
        &self,
        command: &str,
        conf_list: &NetworkConfList,
        plugin: &Value,
        prev_result: Option<Value>,
    ) -> Result<Value, NetworkError> {
        let plugin_type = plugin
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                NetworkError::Configuration(format!("plugin entry without a type: {}", plugin))
            })?
            .to_string();

        let mut stdin_config = plugin.to_owned();
        let obj = stdin_config.as_object_mut().ok_or_else(|| {
            NetworkError::Configuration(format!("plugin entry is not an object: {}", plugin))
        })?;
        obj.insert(
            "cniVersion".to_string(),
            Value::String(conf_list.cni_version.to_owned()),
        );
        obj.insert("name".to_string(), Value::String(conf_list.name.to_owned()));
        if let Some(prev) = prev_result {
            obj.insert("prevResult".to_string(), prev);
        }

        let bin_dir = self
            .bin_path
            .to_owned()
            .unwrap_or_else(|| DEFAULT_CNI_BIN_DIR.into());
        let bin = bin_dir.join(&plugin_type);
        let netns = self
            .net_ns_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut envs: HashMap<String, String> = HashMap::new();
        envs.insert("CNI_COMMAND".to_string(), command.to_string());
        envs.insert("CNI_CONTAINERID".to_string(), self.container_id.to_owned());
        envs.insert("CNI_NETNS".to_string(), netns);
        envs.insert(
            "CNI_IFNAME".to_string(),
            self.if_name.to_owned().unwrap_or_else(|| "eth0".to_string()),
        );
        envs.insert(
            "CNI_PATH".to_string(),
            bin_dir.to_string_lossy().to_string(),
        );
        if let Some(args) = &self.args {
            let joined = args
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(";");
            envs.insert("CNI_ARGS".to_string(), joined);
        }

        debug!(target: "network", "invoking CNI plugin {} {} for {}", plugin_type, command, self.container_id);

        let mut child = tokio::process::Command::new(&bin)
            .envs(&envs)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                NetworkError::Cni(format!("fail to spawn plugin {}: {}", bin.display(), e))
            })?;

        let stdin_payload = stdin_config.to_string();
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(stdin_payload.as_bytes())
                .await
                .map_err(|e| {
                    NetworkError::Cni(format!("fail to write plugin config to stdin: {}", e))
                })?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            NetworkError::Cni(format!("fail to wait for plugin {}: {}", bin.display(), e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let msg = serde_json::from_str::<Value>(&stdout)
                .ok()
                .and_then(|v| v.get("msg").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or(stdout);
            return Err(NetworkError::Cni(format!(
                "plugin {} {} failed with {}: {}",
                plugin_type, command, output.status, msg
            )));
        }

        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout).map_err(|e| {
            NetworkError::Cni(format!(
                "plugin {} produced malformed output: {}",
                plugin_type, e
            ))
        })
    }
}

fn netns_name(path: &Path) -> Result<String, NetworkError> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| NetworkError::Netns(format!("malformed netns path {}", path.display())))
}

/// Extracts the tap device, guest MAC and guest IP configuration from the
/// final CNI reply, per the contract used by tc-redirect-tap: the interface
/// whose sandbox equals the container id describes the VM side, the one
/// whose sandbox equals the netns path is the tap.
pub(crate) fn static_configuration_from_cni(
    cni: &CNIConfiguration,
    result: &SuccessReply,
) -> Result<StaticNetworkConfiguration, NetworkError> {
    let netns = cni
        .net_ns_path
        .as_ref()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();

    let vm_pos = result
        .interfaces
        .iter()
        .position(|i| i.sandbox == cni.container_id)
        .ok_or_else(|| {
            NetworkError::Cni(format!(
                "CNI result has no interface for container id {} (is tc-redirect-tap in the chain?)",
                cni.container_id
            ))
        })?;
    let vm_iface = &result.interfaces[vm_pos];

    let tap_iface = result
        .interfaces
        .iter()
        .find(|i| i.sandbox == netns)
        .ok_or_else(|| {
            NetworkError::Cni(format!(
                "CNI result has no tap interface in netns {}",
                netns
            ))
        })?;

    // the ip entry pointing at the VM interface wins, else the first one
    let ip_entry = result
        .ips
        .iter()
        .find(|ip| ip.interface == Some(vm_pos))
        .or_else(|| result.ips.first())
        .ok_or_else(|| NetworkError::Cni("CNI result carries no IP".to_string()))?;

    let (ip_addr, ip_mask) = match (ip_entry.address.ip(), ip_entry.address.mask()) {
        (IpAddr::V4(addr), IpAddr::V4(mask)) => (addr, mask),
        _ => {
            return Err(NetworkError::Cni(format!(
                "only IPv4 addresses are supported, CNI returned {}",
                ip_entry.address
            )))
        }
    };
    let gateway = match ip_entry.gateway {
        Some(IpAddr::V4(gw)) => gw,
        Some(other) => {
            return Err(NetworkError::Cni(format!(
                "only IPv4 gateways are supported, CNI returned {}",
                other
            )))
        }
        None => {
            return Err(NetworkError::Cni(
                "CNI result carries no gateway".to_string(),
            ))
        }
    };

    let nameservers = result
        .dns
        .nameservers
        .iter()
        .take(2)
        .map(|ns| ns.to_string())
        .collect();

    let mac_address = vm_iface
        .mac
        .as_ref()
        .ok_or_else(|| NetworkError::Cni("CNI result carries no MAC for the VM interface".to_string()))?
        .to_string();

    Ok(StaticNetworkConfiguration {
        mac_address,
        host_dev_name: tap_iface.name.to_owned(),
        ip_configuration: Some(IPConfiguration {
            ip_addr,
            ip_mask,
            gateway,
            nameservers,
            if_name: cni
                .vm_if_name
                .to_owned()
                .unwrap_or_else(|| vm_iface.name.to_owned()),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_iface(ip: Option<IPConfiguration>) -> VmNetworkInterface {
        VmNetworkInterface {
            static_configuration: Some(StaticNetworkConfiguration {
                mac_address: "02:00:00:01:02:03".to_string(),
                host_dev_name: "tap0".to_string(),
                ip_configuration: ip,
            }),
            ..Default::default()
        }
    }

    fn ip_conf() -> IPConfiguration {
        IPConfiguration {
            ip_addr: "10.0.0.2".parse().unwrap(),
            ip_mask: "255.255.255.0".parse().unwrap(),
            gateway: "10.0.0.1".parse().unwrap(),
            nameservers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            if_name: "eth0".to_string(),
        }
    }

    #[test]
    fn test_ip_boot_param() {
        assert_eq!(
            ip_conf().ip_boot_param(),
            "10.0.0.2::10.0.0.1:255.255.255.0::eth0:off:1.1.1.1:8.8.8.8:"
        );
    }

    #[tokio::test]
    async fn test_static_ip_rewrites_kernel_args() {
        let mut ifaces = VmNetworkInterfaces(vec![static_iface(Some(ip_conf()))]);
        let mut kernel_args = KernelArgs::from("ro console=ttyS0");
        ifaces.validate(&kernel_args).unwrap();
        ifaces
            .setup("test-vm", &None, &mut kernel_args)
            .await
            .unwrap();
        assert_eq!(
            kernel_args.to_string(),
            "ro console=ttyS0 ip=10.0.0.2::10.0.0.1:255.255.255.0::eth0:off:1.1.1.1:8.8.8.8:"
        );
    }

    #[tokio::test]
    async fn test_prior_ip_token_is_replaced() {
        // no validation here: an ip= token left by an earlier resolution
        // round must be rewritten, not duplicated
        let mut ifaces = VmNetworkInterfaces(vec![static_iface(Some(ip_conf()))]);
        let mut kernel_args = KernelArgs::from("ro ip=old");
        ifaces
            .setup("test-vm", &None, &mut kernel_args)
            .await
            .unwrap();
        assert_eq!(
            kernel_args.to_string(),
            "ro ip=10.0.0.2::10.0.0.1:255.255.255.0::eth0:off:1.1.1.1:8.8.8.8:"
        );
    }

    #[test]
    fn test_ip_config_conflicts_with_ip_token() {
        let ifaces = VmNetworkInterfaces(vec![static_iface(Some(ip_conf()))]);
        let kernel_args = KernelArgs::from("ro ip=dhcp");
        assert!(ifaces.validate(&kernel_args).is_err());
    }

    #[test]
    fn test_two_interfaces_with_ip_config_fail() {
        let ifaces = VmNetworkInterfaces(vec![static_iface(Some(ip_conf())), static_iface(None)]);
        assert!(ifaces.validate(&KernelArgs::new()).is_err());
    }

    #[test]
    fn test_cni_is_exclusive() {
        let cni_iface = VmNetworkInterface {
            cni_configuration: Some(CNIConfiguration {
                network_name: Some("fcnet".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let ifaces = VmNetworkInterfaces(vec![cni_iface, static_iface(None)]);
        assert!(ifaces.validate(&KernelArgs::new()).is_err());
    }

    #[test]
    fn test_cni_requires_name_or_config() {
        let cni = CNIConfiguration::default();
        assert!(cni.validate().is_err());

        let both = CNIConfiguration {
            network_name: Some("fcnet".to_string()),
            network_config: Some(serde_json::json!({"name": "fcnet", "cniVersion": "1.0.0", "plugins": []})),
            ..Default::default()
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_invalid_mac_rejected() {
        let bad = StaticNetworkConfiguration {
            mac_address: "not-a-mac".to_string(),
            host_dev_name: "tap0".to_string(),
            ip_configuration: None,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_three_nameservers_rejected() {
        let mut conf = ip_conf();
        conf.nameservers.push("9.9.9.9".to_string());
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_wire_lowering() {
        let ifaces = VmNetworkInterfaces(vec![VmNetworkInterface {
            allow_mmds: Some(true),
            ..static_iface(None)
        }]);
        let wire = ifaces.as_wire_interfaces().unwrap();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].iface_id, "1");
        assert_eq!(wire[0].host_dev_name, "tap0");
        assert_eq!(wire[0].guest_mac.as_deref(), Some("02:00:00:01:02:03"));
        assert_eq!(ifaces.mmds_iface_ids(), vec!["1"]);
    }

    #[test]
    fn test_canned_cni_result_fills_static_configuration() {
        let mut cni = CNIConfiguration {
            network_name: Some("fcnet".to_string()),
            vm_if_name: Some("eth0".to_string()),
            container_id: "vm-1234".to_string(),
            net_ns_path: Some("/var/run/netns/vm-1234".into()),
            ..Default::default()
        };
        cni.set_defaults();

        let canned = serde_json::json!({
            "cniVersion": "1.0.0",
            "interfaces": [
                {"name": "veth0", "mac": "aa:bb:cc:dd:ee:00"},
                {"name": "tap0", "mac": "aa:bb:cc:dd:ee:01", "sandbox": "/var/run/netns/vm-1234"},
                {"name": "eth0", "mac": "aa:bb:cc:dd:ee:02", "sandbox": "vm-1234"}
            ],
            "ips": [
                {"address": "192.168.127.2/30", "gateway": "192.168.127.1", "interface": 2}
            ],
            "routes": [{"dst": "0.0.0.0/0"}],
            "dns": {"nameservers": ["1.1.1.1"]}
        });
        let reply: SuccessReply = serde_json::from_value(canned).unwrap();
        let static_conf = static_configuration_from_cni(&cni, &reply).unwrap();
        assert_eq!(static_conf.host_dev_name, "tap0");
        assert_eq!(static_conf.mac_address, "aa:bb:cc:dd:ee:02");
        let ip = static_conf.ip_configuration.unwrap();
        assert_eq!(ip.ip_addr.to_string(), "192.168.127.2");
        assert_eq!(ip.ip_mask.to_string(), "255.255.255.252");
        assert_eq!(ip.gateway.to_string(), "192.168.127.1");
        assert_eq!(ip.nameservers, vec!["1.1.1.1"]);
        assert_eq!(ip.if_name, "eth0");
    }
}
