// Serving Tests - load balancing, server probes, failover, scaling and
// multi-region placement working against one shared balancer

use async_trait::async_trait;
use shardline_core::{Error, Result};
use shardline_storage::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Answers 200 unless the server is listed as down
#[derive(Default)]
struct SwitchableProbe {
    down: Mutex<HashSet<String>>,
}

impl SwitchableProbe {
    fn set_down(&self, id: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }
}

#[async_trait]
impl ServerProbe for SwitchableProbe {
    async fn probe(&self, server: &Server, _path: &str, _timeout: Duration) -> Result<u16> {
        if self.down.lock().unwrap().contains(&server.id) {
            Err(Error::Connectivity(format!("{} refused connection", server.id)))
        } else {
            Ok(200)
        }
    }
}

fn two_region_balancer() -> Arc<LoadBalancer> {
    let lb = Arc::new(LoadBalancer::new(LoadBalancingStrategy::RoundRobin));
    lb.register_region(Region::new("us-east", "north-america", 39.0, -77.5, 1));
    lb.register_region(Region::new("eu-west", "europe", 53.3, -6.3, 2));
    for (id, region) in [("use-1", "us-east"), ("use-2", "us-east"), ("euw-1", "eu-west")] {
        lb.register_server(Server::new(id, region, format!("{}.internal", id), 8080, 50, 1000))
            .unwrap();
    }
    lb
}

#[tokio::test]
async fn test_probe_failures_drive_failover_and_failback() {
    let lb = two_region_balancer();
    let probe = Arc::new(SwitchableProbe::default());
    let checker = ServerHealthChecker::new(
        lb.clone(),
        probe.clone(),
        Duration::from_secs(60),
        Duration::from_millis(200),
        2,
    );
    for id in ["use-1", "use-2", "euw-1"] {
        checker.register_probe(id, "/health").unwrap();
    }
    let failover = FailoverManager::new(lb.clone());
    failover
        .create_policy(FailoverPolicy::new("orders-api", "us-east", "eu-west", 50))
        .unwrap();

    // One failed round is below the consecutive-failure threshold
    probe.set_down("use-1", true);
    probe.set_down("use-2", true);
    checker.check_all().await;
    assert!(lb.server("use-1").unwrap().healthy);
    assert!(failover.evaluate_all().is_empty());

    checker.check_all().await;
    assert!(!lb.server("use-1").unwrap().healthy);
    assert!(!lb.server("use-2").unwrap().healthy);
    assert_eq!(checker.get_health_status("use-1").unwrap().consecutive_failures, 2);

    let events = failover.evaluate_all();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, FailoverStatus::Completed);
    assert!(events[0].automatic);
    assert_eq!(events[0].data_lag_ms, Some(100));
    assert!(!lb.region("us-east").unwrap().active);

    let served = lb.select_server(None, Some("us-east")).unwrap();
    assert_eq!(served.id, "euw-1");

    // Already failed over
    assert!(failover.manual_failover("orders-api", "drill").is_err());

    probe.set_down("use-1", false);
    checker.check_all().await;
    assert!(lb.server("use-1").unwrap().healthy);

    let back = failover.initiate_failback("orders-api").unwrap();
    assert_eq!(back.status, FailoverStatus::Completed);
    assert!(lb.region("us-east").unwrap().active);
    let state = failover.failover_status("orders-api").unwrap();
    assert_eq!(state.current_primary, "us-east");
    assert!(!state.failed_over);
    assert_eq!(lb.select_server(None, Some("us-east")).unwrap().id, "use-1");

    let statuses: Vec<FailoverStatus> = failover.history(10).iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![FailoverStatus::Completed, FailoverStatus::Rejected, FailoverStatus::Completed]
    );

    let global = checker.global_status();
    assert_eq!(global.monitored_servers, 3);
    assert_eq!(global.total_checks, 9);
    assert_eq!(global.healthy_servers, 2);
}

#[tokio::test]
async fn test_failover_blocked_by_replication_lag() {
    let lb = two_region_balancer();
    let failover = FailoverManager::new(lb.clone());
    failover
        .create_policy(FailoverPolicy::new("orders-api", "us-east", "eu-west", 50))
        .unwrap();
    failover.update_replication_lag("eu-west", Duration::from_secs(30));

    let result = failover.manual_failover("orders-api", "planned maintenance");
    assert!(result.is_err());
    assert!(lb.region("us-east").unwrap().active);
    let last = failover.history(1).pop().unwrap();
    assert_eq!(last.status, FailoverStatus::Rejected);
    assert_eq!(last.data_lag_ms, Some(30_000));

    failover.update_replication_lag("eu-west", Duration::from_millis(200));
    let event = failover.manual_failover("orders-api", "planned maintenance").unwrap();
    assert!(!event.automatic);
    assert_eq!(event.status, FailoverStatus::Completed);
}

#[tokio::test]
async fn test_session_affinity_survives_until_server_fails() {
    let lb = Arc::new(
        LoadBalancer::new(LoadBalancingStrategy::RoundRobin)
            .with_session_affinity(true)
            .with_session_ttl(Duration::from_secs(60)),
    );
    lb.register_region(Region::new("us-east", "north-america", 39.0, -77.5, 1));
    for id in ["a", "b", "c"] {
        lb.register_server(Server::new(id, "us-east", id, 9000, 10, 100)).unwrap();
    }

    let first = lb.select_server(Some("cart-42"), None).unwrap();
    for _ in 0..5 {
        assert_eq!(lb.select_server(Some("cart-42"), None).unwrap().id, first.id);
    }

    lb.set_server_health(&first.id, false).unwrap();
    let moved = lb.select_server(Some("cart-42"), None).unwrap();
    assert_ne!(moved.id, first.id);
    assert_eq!(lb.global_stats().active_sessions, 1);

    for id in ["a", "b", "c"] {
        lb.set_server_health(id, false).unwrap();
    }
    let none = lb.select_server(Some("cart-42"), None);
    assert!(matches!(none, Err(Error::NoAvailableServers(_))));
    assert!(none.unwrap_err().is_retryable());
}

#[tokio::test]
async fn test_autoscaler_follows_region_utilization() {
    let lb = two_region_balancer();
    let provisioner = Arc::new(SimpleProvisioner::new());
    let scaler = AutoScaler::new(lb.clone(), provisioner.clone());
    let mut policy = ScalingPolicy::new("us-east", "api-tier");
    policy.max_instances = 3;
    scaler.create_policy(policy).unwrap();
    assert!(scaler.create_policy(ScalingPolicy::new("ap-south", "missing")).is_err());

    for id in ["use-1", "use-2"] {
        lb.update_server_metrics(id, 950, Duration::from_millis(40), 0.0, 70.0, 60.0)
            .unwrap();
    }
    let event = scaler.evaluate_region("us-east").unwrap().unwrap();
    assert_eq!(event.action, ScalingAction::ScaleUp);
    assert_eq!((event.from_count, event.to_count), (2, 3));
    assert_eq!(event.utilization, 95);
    assert_eq!(provisioner.instance_count("us-east"), Some(3));

    // Inside the cooldown window nothing happens
    assert!(scaler.evaluate_region("us-east").unwrap().is_none());

    let patched = scaler
        .update_policy(
            "us-east",
            &ScalingPolicyPatch {
                cooldown: Some(Duration::ZERO),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(patched.cooldown, Duration::ZERO);

    // Already at the maximum
    assert!(scaler.evaluate_region("us-east").unwrap().is_none());

    for id in ["use-1", "use-2"] {
        lb.update_server_metrics(id, 50, Duration::from_millis(10), 0.0, 10.0, 10.0)
            .unwrap();
    }
    let event = scaler.evaluate_region("us-east").unwrap().unwrap();
    assert_eq!(event.action, ScalingAction::ScaleDown);
    assert_eq!((event.from_count, event.to_count), (3, 2));

    let metrics = scaler.metrics();
    assert_eq!((metrics.scale_up_count, metrics.scale_down_count), (1, 1));
    assert_eq!(scaler.get_scaling_events(Some("us-east"), 10).len(), 2);
    assert!(scaler.get_scaling_events(Some("eu-west"), 10).is_empty());
}

#[tokio::test]
async fn test_multi_region_placement_uses_balancer_health() {
    let lb = two_region_balancer();
    let deployment = MultiRegionDeployment::new(lb.clone());
    for (id, region, lat, lon) in [
        ("iad", "us-east", 38.95, -77.45),
        ("dub", "eu-west", 53.35, -6.26),
    ] {
        deployment.register_data_center(DataCenter {
            id: id.to_string(),
            name: id.to_uppercase(),
            location: region.to_string(),
            provider: "aws".to_string(),
            region: region.to_string(),
            latitude: lat,
            longitude: lon,
            capacity: 100,
            current_count: 25,
            active: true,
            primary: region == "us-east",
            tier: "standard".to_string(),
            created_at: chrono::Utc::now(),
        });
    }
    deployment
        .create_config(MultiRegionConfig::new(
            "global",
            vec!["us-east".to_string(), "eu-west".to_string()],
            DeploymentStrategy::ActiveWarm,
        ))
        .unwrap();
    assert!(deployment
        .create_config(MultiRegionConfig::new("empty", Vec::new(), DeploymentStrategy::ActiveActive))
        .is_err());

    let split = deployment.optimize_traffic("global").unwrap();
    assert_eq!(split["us-east"], 80.0);
    assert_eq!(split["eu-west"], 20.0);

    deployment.update_latency("sa-east", "us-east", 120);
    deployment.update_latency("sa-east", "eu-west", 190);
    assert_eq!(deployment.select_region_for_request("sa-east", "global").unwrap(), "us-east");
    assert_eq!(deployment.select_region_for_request("eu-west", "global").unwrap(), "eu-west");

    let km = deployment.distance_between_data_centers("iad", "dub").unwrap();
    assert!((5400.0..5700.0).contains(&km), "distance {}", km);

    lb.set_server_health("euw-1", false).unwrap();
    let status = deployment.status("global").unwrap();
    assert_eq!(status.total_data_centers, 2);
    assert_eq!(status.total_capacity, 200);
    assert_eq!(status.healthy_servers, 2);
    assert_eq!(status.traffic_distribution, split);
}
