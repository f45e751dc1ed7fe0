//! End-to-end container lifecycle.
//!
//! Needs root, cgroup v1, overlayfs and iptables, plus a busybox image
//! archive named by `KEG_TEST_IMAGE`. Built only with `--features integration`.

#![cfg(feature = "integration")]

use std::path::PathBuf;

use keg::cgroup::ResourceLimits;
use keg::runtime::{LaunchOutcome, RunOptions, RuntimeConfig, container, run};
use keg_common::{ContainerStatus, KegError, MemoryLimit};
use keg_network::NetworkContext;
use tempfile::TempDir;

fn setup() -> Option<(TempDir, RuntimeConfig)> {
    let Some(image) = std::env::var_os("KEG_TEST_IMAGE").map(PathBuf::from) else {
        eprintln!("KEG_TEST_IMAGE not set, skipping");
        return None;
    };
    let temp = TempDir::new().unwrap();
    let config = RuntimeConfig::default()
        .with_root(temp.path())
        .with_cgroup_parent("keg-test");
    config.paths.create_dirs().unwrap();
    std::fs::copy(image, config.paths.images().join("busybox.tar")).unwrap();
    Some((temp, config))
}

fn detached(name: &str) -> RunOptions {
    RunOptions {
        name: Some(name.to_string()),
        image: "busybox".to_string(),
        command: vec!["top".to_string()],
        detach: true,
        ..RunOptions::default()
    }
}

#[test_log::test(tokio::test)]
async fn run_stop_remove() {
    let Some((_temp, config)) = setup() else {
        return;
    };
    let options = RunOptions {
        limits: ResourceLimits {
            memory: Some(MemoryLimit::parse("100m").unwrap()),
            ..ResourceLimits::default()
        },
        ..detached("lifecycle")
    };

    let outcome = run(&config, options).await.unwrap();
    assert!(matches!(outcome, LaunchOutcome::Detached { .. }));

    let record = config.records().load("lifecycle").unwrap();
    assert_eq!(record.status, ContainerStatus::Running);
    assert!(record.pid > 0);
    assert!(config.paths.container_merged("lifecycle").join("bin").exists());

    let stopped = container::stop(&config, "lifecycle").unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert_eq!(stopped.pid, -1);

    container::remove(&config, "lifecycle").await.unwrap();
    assert!(!config.records().exists("lifecycle"));
    assert!(!config.paths.container("lifecycle").exists());
    assert!(matches!(
        container::remove(&config, "lifecycle").await,
        Err(KegError::ContainerNotFound { .. })
    ));
}

#[test_log::test(tokio::test)]
async fn foreground_run_cleans_up() {
    let Some((_temp, config)) = setup() else {
        return;
    };
    let options = RunOptions {
        command: vec!["/bin/sh".to_string(), "-c".to_string(), "exit".to_string()],
        detach: false,
        ..detached("oneshot")
    };

    let outcome = run(&config, options).await.unwrap();
    assert_eq!(
        outcome,
        LaunchOutcome::Exited {
            name: "oneshot".to_string(),
            code: 0
        }
    );
    assert!(!config.records().exists("oneshot"));
    assert!(!config.paths.container("oneshot").exists());
    assert!(config.paths.image_layer("busybox").exists());
}

#[test_log::test(tokio::test)]
async fn connect_to_bridge() {
    let Some((_temp, config)) = setup() else {
        return;
    };

    let mut networks = NetworkContext::load(&config.paths).unwrap();
    networks
        .create_network("kegtest0", "bridge", "172.24.0.0/24")
        .await
        .unwrap();

    let options = RunOptions {
        ports: vec!["18080:80".to_string()],
        network: Some("kegtest0".to_string()),
        ..detached("web")
    };
    run(&config, options).await.unwrap();

    let record = config.records().load("web").unwrap();
    let ip: ipnetwork::Ipv4Network = record.ip.as_deref().unwrap().parse().unwrap();
    let subnet: ipnetwork::Ipv4Network = "172.24.0.0/24".parse().unwrap();
    assert!(subnet.contains(ip.ip()));

    let rules = std::process::Command::new("iptables")
        .args(["-t", "nat", "-S", "PREROUTING"])
        .output()
        .unwrap();
    let rules = String::from_utf8_lossy(&rules.stdout);
    assert!(rules.contains("--dport 18080"));
    assert!(rules.contains(&format!("{}:80", ip.ip())));

    container::stop(&config, "web").unwrap();
    container::remove(&config, "web").await.unwrap();

    let rules = std::process::Command::new("iptables")
        .args(["-t", "nat", "-S", "PREROUTING"])
        .output()
        .unwrap();
    assert!(!String::from_utf8_lossy(&rules.stdout).contains("--dport 18080"));

    let mut networks = NetworkContext::load(&config.paths).unwrap();
    networks.remove_network("kegtest0").await.unwrap();
}
