//! Playbook → scheduler → real local shell sessions (and a refused SSH connection)

use eagledeploy::executor::TaskExecutor;
use eagledeploy::models::{Credential, Endpoint, FailureKind, Task};
use eagledeploy::playbook::{parse_playbook_yaml, LoadOptions};
use eagledeploy::scheduler::{Scheduler, SchedulerConfig};
use eagledeploy::session::host_key::AcceptAnyHost;
use eagledeploy::session::{DefaultSessionFactory, SshOptions};
use std::sync::Arc;
use std::time::Duration;

fn scheduler() -> Scheduler {
    let ssh = SshOptions::new(Duration::from_secs(2), Arc::new(AcceptAnyHost));
    let executor = TaskExecutor::new(Arc::new(DefaultSessionFactory::new(ssh)));
    Scheduler::new(
        Arc::new(executor),
        SchedulerConfig {
            task_timeout: Some(Duration::from_secs(20)),
        },
    )
}

#[tokio::test]
async fn test_local_playbook_runs() {
    let yaml = r#"
name: local-checks
tasks:
  - name: greet
    command: echo hello
  - name: mixed
    command: "echo out; echo err >&2; echo out2"
  - name: broken
    command: exit 3
"#;
    let playbook = parse_playbook_yaml(yaml, &LoadOptions::default()).unwrap();
    let result = scheduler().run_all(playbook.tasks).await.unwrap();

    assert_eq!(result.len(), 3);
    assert_eq!(result.outcomes[0].output.as_deref(), Some("hello\n"));
    assert_eq!(result.outcomes[1].output.as_deref(), Some("out\nerr\nout2\n"));
    assert_eq!(result.outcomes[2].failure, Some(FailureKind::NonZeroExit));
    assert_eq!(result.outcomes[2].exit_code, Some(3));
    assert_eq!(result.failure_count(), 1);
}

#[tokio::test]
async fn test_refused_ssh_target_does_not_affect_local_tasks() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let tasks = vec![
        Task::local("before", "echo before"),
        Task::remote(
            "remote",
            "uptime",
            Endpoint::new("127.0.0.1", port),
            Credential::password("deploy", "secret"),
        ),
        Task::local("after", "echo after"),
    ];

    let result = scheduler().run_all(tasks).await.unwrap();

    assert_eq!(result.outcomes[0].output.as_deref(), Some("before\n"));
    assert_eq!(result.outcomes[1].failure, Some(FailureKind::Connect));
    assert_eq!(result.outcomes[2].output.as_deref(), Some("after\n"));
}
