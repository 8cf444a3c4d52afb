//! Lifecycle tests against a permissive mock of the firecracker API served
//! over a UNIX socket, with a plain `sleep` child standing in for the VMM.

use std::path::PathBuf;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use hyperlocal::UnixServerExt;
use tokio::task::JoinHandle;

use firevisor::model::cpu_template::CPUTemplate;
use firevisor::model::machine_configuration::MachineConfiguration;
use firevisor::{Config, Machine, MachineError, MachineState, SnapshotConfig};

async fn handle(req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/machine-config") => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Body::from(
                r#"{"vcpu_count":1,"mem_size_mib":128,"smt":false}"#,
            ))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap(),
    };
    Ok(response)
}

fn test_dir(tag: &str) -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = std::env::temp_dir().join(format!("firevisor-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn spawn_mock_api(socket_path: &PathBuf) -> JoinHandle<()> {
    let server = Server::bind_unix(socket_path)
        .expect("fail to bind mock API socket")
        .serve(make_service_fn(|_| async {
            Ok::<_, hyper::Error>(service_fn(handle))
        }));
    tokio::spawn(async move {
        let _ = server.await;
    })
}

fn machine_cfg() -> MachineConfiguration {
    MachineConfiguration::default()
        .with_vcpu_count(1)
        .with_mem_size_mib(128)
        .with_cpu_template(&CPUTemplate::T2)
}

fn fake_vmm() -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sleep");
    cmd.arg("60");
    cmd
}

#[tokio::test]
async fn test_machine_lifecycle_against_mock_vmm() {
    let dir = test_dir("lifecycle");
    let socket_path = dir.join("firecracker.socket");
    let server = spawn_mock_api(&socket_path);

    let config = Config::default()
        .with_socket_path(&socket_path)
        .with_kernel_image_path(dir.join("vmlinux"))
        .with_machine_config(machine_cfg())
        .set_disable_validation(true);
    let mut machine = Machine::new(config).expect("failed to create machine");
    machine.set_command(fake_vmm());

    machine.start().await.expect("start failed");
    assert_eq!(machine.state(), MachineState::Running);
    assert!(machine.pid().unwrap() > 0);

    machine.pause().await.expect("pause failed");
    assert_eq!(machine.state(), MachineState::Paused);
    machine
        .create_snapshot(dir.join("mem"), dir.join("snap"))
        .await
        .expect("create_snapshot failed");
    machine.resume().await.expect("resume failed");
    assert_eq!(machine.state(), MachineState::Running);

    machine.stop_vmm().await.expect("stop_vmm failed");
    assert_eq!(machine.state(), MachineState::Stopped);
    assert!(machine.pid().is_none());

    machine.wait().await.expect("wait failed");
    // repeated wait yields the cached terminal result
    machine.wait().await.expect("second wait failed");
    // stop_vmm is idempotent
    machine.stop_vmm().await.expect("second stop_vmm failed");

    assert!(matches!(
        machine.start().await,
        Err(MachineError::AlreadyStarted)
    ));

    server.abort();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_start_fails_when_vmm_exits_early() {
    let dir = test_dir("earlyexit");
    // no mock API server: the socket never turns up and the child dies at
    // once, which the readiness poll must detect
    let config = Config::default()
        .with_socket_path(dir.join("missing.socket"))
        .with_kernel_image_path(dir.join("vmlinux"))
        .with_machine_config(machine_cfg())
        .set_disable_validation(true);
    let mut machine = Machine::new(config).unwrap();
    machine.set_command(tokio::process::Command::new("false"));

    let err = machine.start().await.unwrap_err();
    assert!(
        matches!(err, MachineError::SocketReadiness(_)),
        "unexpected error: {err}"
    );
    assert_eq!(machine.state(), MachineState::Stopped);

    // a failed start is terminal
    assert!(matches!(
        machine.start().await,
        Err(MachineError::AlreadyStarted)
    ));

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_snapshot_load_skips_cold_boot_pipeline() {
    let dir = test_dir("snapload");
    let socket_path = dir.join("firecracker.socket");
    let server = spawn_mock_api(&socket_path);

    let config = Config::default()
        .with_socket_path(&socket_path)
        .with_machine_config(machine_cfg())
        .with_snapshot_config(SnapshotConfig {
            mem_file_path: Some(dir.join("mem")),
            mem_backend: None,
            snapshot_path: dir.join("snap"),
            enable_diff_snapshots: false,
            resume_vm: true,
        })
        .set_disable_validation(true);
    let mut machine = Machine::new(config).unwrap();
    machine.set_command(fake_vmm());

    assert_eq!(
        machine.handlers().setup.names(),
        vec!["start_vmm", "create_log_files", "bootstrap_logging"]
    );
    assert_eq!(machine.handlers().init.names(), vec!["load_snapshot"]);

    machine.start().await.expect("snapshot start failed");
    assert_eq!(machine.state(), MachineState::Running);

    machine.stop_vmm().await.unwrap();
    server.abort();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_runtime_updates_against_mock() {
    let dir = test_dir("updates");
    let socket_path = dir.join("firecracker.socket");
    let server = spawn_mock_api(&socket_path);

    let config = Config::default()
        .with_socket_path(&socket_path)
        .with_kernel_image_path(dir.join("vmlinux"))
        .with_machine_config(machine_cfg())
        .with_init_metadata(serde_json::json!({"hostname": "test-vm"}))
        .set_disable_validation(true);
    let mut machine = Machine::new(config).unwrap();
    machine.set_command(fake_vmm());
    machine.start().await.expect("start failed");

    machine
        .update_balloon(256)
        .await
        .expect("update_balloon failed");
    machine
        .update_metadata(&serde_json::json!({"stage": "late"}))
        .await
        .expect("update_metadata failed");
    machine.flush_metrics().await.expect("flush_metrics failed");

    machine.stop_vmm().await.unwrap();
    server.abort();
    std::fs::remove_dir_all(&dir).ok();
}
