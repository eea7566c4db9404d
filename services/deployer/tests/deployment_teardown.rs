use std::sync::Arc;
use std::time::Duration;

use dirboot_deployer::cloud::{CloudErrorType, CloudProperties};
use dirboot_deployer::disk::{Disk, DiskRepo, SqliteDiskRepo};
use dirboot_deployer::stage::StepState;
use dirboot_deployer::stemcell::CloudStemcell;
use dirboot_deployer::testing::{CloudCall, FakeCloud, FakeSshTunnelFactory, FakeStateBuilder, FakeVm};
use dirboot_deployer::{Deployment, EventLoggerStage, Instance, InstanceSettings};
use dirboot_id::{DiskCid, StemcellCid, VmCid};

struct Fixture {
    cloud: Arc<FakeCloud>,
    repo: Arc<SqliteDiskRepo>,
    vms: Vec<FakeVm>,
    deployment: Deployment,
}

fn instance(job_name: &str, id: u32, vm: &FakeVm) -> Instance {
    Instance::new(
        job_name,
        id,
        Box::new(vm.clone()),
        Arc::new(FakeSshTunnelFactory::new()),
        Arc::new(FakeStateBuilder::new()),
        InstanceSettings::default(),
    )
}

/// Two instances, one recorded disk and one stemcell.
fn fixture() -> Fixture {
    let cloud = Arc::new(FakeCloud::new());
    let repo = Arc::new(SqliteDiskRepo::open_in_memory().unwrap());

    let vms = vec![
        FakeVm::new(VmCid::parse("fake-vm-cid-1").unwrap()),
        FakeVm::new(VmCid::parse("fake-vm-cid-2").unwrap()),
    ];
    let instances = vec![instance("director", 0, &vms[0]), instance("director", 1, &vms[1])];

    let record = repo
        .save(
            &DiskCid::parse("fake-disk-cid").unwrap(),
            1024,
            &CloudProperties::new(),
        )
        .unwrap();
    let disks = vec![Disk::new(record, cloud.clone(), repo.clone())];

    let stemcells = vec![CloudStemcell::new(
        StemcellCid::parse("fake-stemcell-cid").unwrap(),
        "bosh-warden-stemcell",
        "3000",
        cloud.clone(),
    )];

    let deployment = Deployment::new(
        instances,
        disks,
        stemcells,
        Duration::from_secs(10),
        Duration::from_millis(500),
    );

    Fixture {
        cloud,
        repo,
        vms,
        deployment,
    }
}

#[tokio::test]
async fn test_delete_drains_last_first_and_skips_missing_disk() {
    let mut f = fixture();
    f.cloud
        .fail_for_disk(&DiskCid::parse("fake-disk-cid").unwrap(), CloudErrorType::DiskNotFound);
    let stage = EventLoggerStage::new("deleting deployment");

    f.deployment.delete(&stage).await.unwrap();

    assert_eq!(
        stage.step_names(),
        vec![
            "Waiting for the agent on VM 'fake-vm-cid-2'".to_string(),
            "Stopping jobs on instance 'director/1'".to_string(),
            "Deleting VM 'fake-vm-cid-2'".to_string(),
            "Waiting for the agent on VM 'fake-vm-cid-1'".to_string(),
            "Stopping jobs on instance 'director/0'".to_string(),
            "Deleting VM 'fake-vm-cid-1'".to_string(),
            "Deleting disk 'fake-disk-cid'".to_string(),
            "Deleting stemcell 'fake-stemcell-cid'".to_string(),
        ]
    );
    assert_eq!(
        stage.outcome("Deleting disk 'fake-disk-cid'"),
        Some(StepState::Skipped)
    );
    assert_eq!(
        stage.outcome("Deleting stemcell 'fake-stemcell-cid'"),
        Some(StepState::Finished)
    );

    for vm in &f.vms {
        assert_eq!(
            vm.ready_waits(),
            vec![(Duration::from_secs(10), Duration::from_millis(500))]
        );
    }
    assert!(f.deployment.instances().is_empty());
    assert!(f.deployment.disks().is_empty());
    assert!(f.deployment.stemcells().is_empty());
    assert!(f.repo.all().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_stops_at_failed_instance() {
    let mut f = fixture();
    f.vms[1].fail_delete_with(CloudErrorType::Other("Bosh::Clouds::CloudError".into()));
    let stage = EventLoggerStage::new("deleting deployment");

    f.deployment.delete(&stage).await.unwrap_err();

    assert_eq!(f.deployment.instances().len(), 2);
    assert_eq!(f.deployment.disks().len(), 1);
    assert!(f.vms[0].calls().is_empty());
    assert!(f.cloud.calls().is_empty());
}

#[tokio::test]
async fn test_delete_resumes_after_stemcell_failure() {
    let mut f = fixture();
    f.cloud
        .fail_with("delete_stemcell", CloudErrorType::Other("Bosh::Clouds::CloudError".into()));
    let stage = EventLoggerStage::new("deleting deployment");

    let err = f.deployment.delete(&stage).await.unwrap_err();
    assert!(err.to_string().contains("fake-delete_stemcell-error"));
    assert!(f.deployment.instances().is_empty());
    assert!(f.deployment.disks().is_empty());
    assert_eq!(f.deployment.stemcells().len(), 1);

    // The stemcell has since disappeared from the cloud.
    f.cloud.fail_with("delete_stemcell", CloudErrorType::StemcellNotFound);
    let retry = EventLoggerStage::new("deleting deployment");
    f.deployment.delete(&retry).await.unwrap();

    assert_eq!(
        retry.step_names(),
        vec!["Deleting stemcell 'fake-stemcell-cid'".to_string()]
    );
    assert_eq!(
        retry.outcome("Deleting stemcell 'fake-stemcell-cid'"),
        Some(StepState::Skipped)
    );
    assert!(f.deployment.stemcells().is_empty());
    assert_eq!(
        f.cloud
            .calls()
            .iter()
            .filter(|c| matches!(c, CloudCall::DeleteStemcell(_)))
            .count(),
        2
    );
}
