use std::{fmt, future::Future, pin::Pin, sync::Arc};

use log::{debug, warn};

use super::machine::{Machine, MachineError};

pub const START_VMM_HANDLER_NAME: &'static str = "start_vmm";
pub const CREATE_LOG_FILES_HANDLER_NAME: &'static str = "create_log_files";
pub const BOOTSTRAP_LOGGING_HANDLER_NAME: &'static str = "bootstrap_logging";
pub const CREATE_MACHINE_HANDLER_NAME: &'static str = "create_machine";
pub const CREATE_BOOT_SOURCE_HANDLER_NAME: &'static str = "create_boot_source";
pub const ATTACH_DRIVES_HANDLER_NAME: &'static str = "attach_drives";
pub const CREATE_NETWORK_INTERFACES_HANDLER_NAME: &'static str = "create_network_interfaces";
pub const ADD_VSOCKS_HANDLER_NAME: &'static str = "add_vsocks";
pub const SET_MMDS_HANDLER_NAME: &'static str = "set_mmds";
pub const CONFIG_MMDS_HANDLER_NAME: &'static str = "config_mmds";
pub const SET_METADATA_HANDLER_NAME: &'static str = "set_metadata";
pub const CREATE_BALLOON_HANDLER_NAME: &'static str = "create_balloon";
pub const LINK_FILES_TO_ROOTFS_HANDLER_NAME: &'static str = "link_files_to_rootfs";
pub const LOAD_SNAPSHOT_HANDLER_NAME: &'static str = "load_snapshot";

pub const VALIDATE_CFG_HANDLER_NAME: &'static str = "validate_config";
pub const VALIDATE_NETWORK_CFG_HANDLER_NAME: &'static str = "validate_network_cfg";
pub const VALIDATE_JAILER_CFG_HANDLER_NAME: &'static str = "validate_jailer_cfg";

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), MachineError>> + Send + 'a>>;

/// A named step of the machine assembly pipeline. The function borrows the
/// machine mutably for the duration of one call; the name is what the list
/// operations match on, case-sensitively.
///
/// Custom handlers are written as plain functions returning a boxed future:
///
/// ```ignore
/// fn wipe_scratch(m: &mut Machine) -> HandlerFuture<'_> {
///     Box::pin(async move {
///         tokio::fs::remove_dir_all(m.config().scratch_dir()).await?;
///         Ok(())
///     })
/// }
/// let handler = Handler::new("wipe_scratch", wipe_scratch);
/// ```
#[derive(Clone)]
pub struct Handler {
    name: String,
    func: Arc<dyn for<'a> Fn(&'a mut Machine) -> HandlerFuture<'a> + Send + Sync>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("name", &self.name).finish()
    }
}

impl Handler {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: for<'a> Fn(&'a mut Machine) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn call(&self, m: &mut Machine) -> Result<(), MachineError> {
        (self.func)(m).await
    }
}

/// An ordered, mutable list of handlers. Duplicate names are permitted and
/// every operation keyed by name applies to all matches.
#[derive(Debug, Clone, Default)]
pub struct HandlerList(Vec<Handler>);

impl HandlerList {
    pub fn blank() -> Self {
        HandlerList(Vec::new())
    }

    /// append pushes the handler at the tail of the list.
    pub fn append(&mut self, handler: Handler) {
        self.0.push(handler);
    }

    /// prepend pushes the handler at the head of the list.
    pub fn prepend(&mut self, handler: Handler) {
        self.0.insert(0, handler);
    }

    /// append_after inserts the handler immediately after the first entry
    /// named `name`. A missing name leaves the list unchanged.
    pub fn append_after(&mut self, name: &str, handler: Handler) {
        if let Some(idx) = self.0.iter().position(|h| h.name == name) {
            self.0.insert(idx + 1, handler);
        }
    }

    /// remove deletes every entry named `name`. A missing name is not an
    /// error.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| h.name != name);
    }

    /// swap replaces every entry sharing the handler's name, keeping their
    /// positions. No match leaves the list unchanged.
    pub fn swap(&mut self, handler: &Handler) {
        for h in self.0.iter_mut() {
            if h.name == handler.name {
                *h = handler.clone();
            }
        }
    }

    /// swappend is swap when at least one entry matches, append otherwise.
    pub fn swappend(&mut self, handler: Handler) {
        if self.has(&handler.name) {
            self.swap(&handler);
        } else {
            self.append(handler);
        }
    }

    /// has reports whether any entry is named `name`.
    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|h| h.name == name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// clear removes every handler in the list.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// names returns the handler names in list order.
    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|h| h.name.as_str()).collect()
    }

    /// run invokes the handlers in order, aborting at the first error.
    /// Mutations already applied to the VMM by earlier handlers are not
    /// rolled back.
    pub async fn run(&self, m: &mut Machine) -> Result<(), MachineError> {
        for handler in &self.0 {
            debug!(target: "HandlerList::run", "running handler {}", handler.name);
            handler.call(m).await.map_err(|e| {
                warn!(target: "HandlerList::run", "handler {} failed: {}", handler.name, e);
                e
            })?;
        }

        Ok(())
    }
}

/// The three pipelines a machine runs: `validation` before anything is
/// spawned, `setup` to bring the process and its devices up, `init` for the
/// metadata service and everything else that wants the devices in place.
#[derive(Debug, Clone)]
pub struct Handlers {
    pub validation: HandlerList,
    pub setup: HandlerList,
    pub init: HandlerList,
}

impl Default for Handlers {
    fn default() -> Self {
        Handlers {
            validation: default_validation_handler_list(),
            setup: default_setup_handler_list(),
            init: default_init_handler_list(),
        }
    }
}

impl Handlers {
    /// Pipelines for booting from a snapshot: the boot-source, drive and
    /// network PUTs are replaced wholesale by a single load_snapshot step and
    /// no InstanceStart is issued afterwards.
    pub fn for_snapshot_load() -> Self {
        let mut setup = HandlerList::blank();
        setup.append(start_vmm_handler());
        setup.append(create_log_files_handler());
        setup.append(bootstrap_logging_handler());

        let mut init = HandlerList::blank();
        init.append(load_snapshot_handler());

        Handlers {
            validation: default_validation_handler_list(),
            setup,
            init,
        }
    }

    pub async fn run(&self, m: &mut Machine) -> Result<(), MachineError> {
        self.validation.run(m).await?;
        self.setup.run(m).await?;
        self.init.run(m).await?;

        Ok(())
    }
}

pub fn default_validation_handler_list() -> HandlerList {
    let mut list = HandlerList::blank();
    list.append(config_validation_handler());
    list.append(network_config_validation_handler());
    list.append(jailer_config_validation_handler());
    list
}

pub fn default_setup_handler_list() -> HandlerList {
    let mut list = HandlerList::blank();
    list.append(start_vmm_handler());
    list.append(create_log_files_handler());
    list.append(bootstrap_logging_handler());
    list.append(create_machine_handler());
    list.append(create_boot_source_handler());
    list.append(attach_drives_handler());
    list.append(create_network_interfaces_handler());
    list.append(add_vsocks_handler());
    list
}

pub fn default_init_handler_list() -> HandlerList {
    let mut list = HandlerList::blank();
    list.append(set_mmds_handler());
    list.append(config_mmds_handler());
    list.append(set_metadata_handler());
    list
}

pub fn config_validation_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(async move { m.config().validate() })
    }
    Handler::new(VALIDATE_CFG_HANDLER_NAME, run)
}

pub fn network_config_validation_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(async move { m.config().validate_network() })
    }
    Handler::new(VALIDATE_NETWORK_CFG_HANDLER_NAME, run)
}

pub fn jailer_config_validation_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(async move { m.config().validate_jailer() })
    }
    Handler::new(VALIDATE_JAILER_CFG_HANDLER_NAME, run)
}

pub fn start_vmm_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.start_vmm())
    }
    Handler::new(START_VMM_HANDLER_NAME, run)
}

pub fn create_log_files_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(async move { m.create_log_files() })
    }
    Handler::new(CREATE_LOG_FILES_HANDLER_NAME, run)
}

pub fn bootstrap_logging_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.bootstrap_logging())
    }
    Handler::new(BOOTSTRAP_LOGGING_HANDLER_NAME, run)
}

pub fn create_machine_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.create_machine())
    }
    Handler::new(CREATE_MACHINE_HANDLER_NAME, run)
}

pub fn create_boot_source_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.create_boot_source())
    }
    Handler::new(CREATE_BOOT_SOURCE_HANDLER_NAME, run)
}

pub fn attach_drives_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.attach_drives())
    }
    Handler::new(ATTACH_DRIVES_HANDLER_NAME, run)
}

pub fn create_network_interfaces_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.create_network_interfaces())
    }
    Handler::new(CREATE_NETWORK_INTERFACES_HANDLER_NAME, run)
}

pub fn add_vsocks_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.add_vsocks())
    }
    Handler::new(ADD_VSOCKS_HANDLER_NAME, run)
}

pub fn set_mmds_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.set_mmds_contents())
    }
    Handler::new(SET_MMDS_HANDLER_NAME, run)
}

pub fn config_mmds_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.set_mmds_config())
    }
    Handler::new(CONFIG_MMDS_HANDLER_NAME, run)
}

pub fn set_metadata_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.set_init_metadata())
    }
    Handler::new(SET_METADATA_HANDLER_NAME, run)
}

pub fn create_balloon_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.create_balloon())
    }
    Handler::new(CREATE_BALLOON_HANDLER_NAME, run)
}

pub fn load_snapshot_handler() -> Handler {
    fn run(m: &mut Machine) -> HandlerFuture<'_> {
        Box::pin(m.load_snapshot_from_config())
    }
    Handler::new(LOAD_SNAPSHOT_HANDLER_NAME, run)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Handler {
        fn run(_m: &mut Machine) -> HandlerFuture<'_> {
            Box::pin(async { Ok(()) })
        }
        Handler::new(name, run)
    }

    #[test]
    fn test_default_setup_order() {
        let list = default_setup_handler_list();
        assert_eq!(
            list.names(),
            vec![
                "start_vmm",
                "create_log_files",
                "bootstrap_logging",
                "create_machine",
                "create_boot_source",
                "attach_drives",
                "create_network_interfaces",
                "add_vsocks",
            ]
        );
    }

    #[test]
    fn test_default_init_order() {
        let list = default_init_handler_list();
        assert_eq!(list.names(), vec!["set_mmds", "config_mmds", "set_metadata"]);
    }

    #[test]
    fn test_remove_then_append_after() {
        let mut list = default_setup_handler_list();
        list.remove(BOOTSTRAP_LOGGING_HANDLER_NAME);
        list.append_after(CREATE_MACHINE_HANDLER_NAME, noop("inject"));
        assert_eq!(
            list.names(),
            vec![
                "start_vmm",
                "create_log_files",
                "create_machine",
                "inject",
                "create_boot_source",
                "attach_drives",
                "create_network_interfaces",
                "add_vsocks",
            ]
        );
    }

    #[test]
    fn test_append_after_missing_name_is_noop() {
        let mut list = default_setup_handler_list();
        let before = list
            .names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        list.append_after("no_such_handler", noop("inject"));
        assert_eq!(list.names(), before);
    }

    #[test]
    fn test_remove_then_has() {
        let mut list = default_setup_handler_list();
        assert!(list.has(ATTACH_DRIVES_HANDLER_NAME));
        list.remove(ATTACH_DRIVES_HANDLER_NAME);
        assert!(!list.has(ATTACH_DRIVES_HANDLER_NAME));
        // removing again is fine
        list.remove(ATTACH_DRIVES_HANDLER_NAME);
        assert!(!list.has(ATTACH_DRIVES_HANDLER_NAME));
    }

    #[test]
    fn test_swap_replaces_all_matches() {
        let mut list = HandlerList::blank();
        list.append(noop("a"));
        list.append(noop("b"));
        list.append(noop("a"));
        list.swap(&noop("a"));
        assert_eq!(list.names(), vec!["a", "b", "a"]);

        // no match leaves the list unchanged
        list.swap(&noop("zzz"));
        assert_eq!(list.names(), vec!["a", "b", "a"]);
    }

    #[test]
    fn test_swappend_is_idempotent() {
        let mut list = HandlerList::blank();
        list.append(noop("a"));
        list.swappend(noop("b"));
        assert_eq!(list.names(), vec!["a", "b"]);
        list.swappend(noop("b"));
        assert_eq!(list.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_prepend_and_clear() {
        let mut list = HandlerList::blank();
        list.append(noop("tail"));
        list.prepend(noop("head"));
        assert_eq!(list.names(), vec!["head", "tail"]);
        list.clear();
        assert!(list.is_empty());
    }

    #[test]
    fn test_duplicate_names_all_removed() {
        let mut list = HandlerList::blank();
        list.append(noop("dup"));
        list.append(noop("other"));
        list.append(noop("dup"));
        list.remove("dup");
        assert_eq!(list.names(), vec!["other"]);
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let mut list = HandlerList::blank();
        list.append(noop("Inject"));
        assert!(!list.has("inject"));
        list.remove("inject");
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_snapshot_load_pipelines() {
        let handlers = Handlers::for_snapshot_load();
        assert_eq!(
            handlers.setup.names(),
            vec!["start_vmm", "create_log_files", "bootstrap_logging"]
        );
        assert_eq!(handlers.init.names(), vec!["load_snapshot"]);
    }
}
