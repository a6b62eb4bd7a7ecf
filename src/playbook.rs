//! Playbook loading: YAML in, validated task list out
//!
//! Two shapes are accepted. A bare list of tasks:
//!
//! ```yaml
//! - name: uptime
//!   command: uptime
//!   target: web1.example.com
//!   username: deploy
//!   key_path: ~/.ssh/deploy_ed25519
//! ```
//!
//! or a document whose tasks fan out over `hosts`:
//!
//! ```yaml
//! name: restart-web
//! version: 1
//! hosts: [web1, web2]
//! username: deploy
//! settings:
//!   timeout: 60
//!   retries: 1
//! tasks:
//!   - name: restart
//!     command: sudo systemctl restart nginx
//! ```

use crate::error::{EagleError, Result};
use crate::models::{
    Credential, Endpoint, Task, DEFAULT_SSH_PORT, MAX_TASK_COUNT, MAX_YAML_SIZE,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Run settings a playbook may carry; applied over the loaded [`Settings`](crate::settings::Settings)
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PlaybookSettings {
    /// Per-task timeout in seconds
    pub timeout: Option<u64>,
    pub port: Option<u16>,
    pub retries: Option<u32>,
}

/// Resolution defaults supplied by the caller
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Port for tasks that name none
    pub default_port: u16,
    /// Forces every remote task onto this port
    pub port_override: Option<u16>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_SSH_PORT,
            port_override: None,
        }
    }
}

/// A loaded playbook
#[derive(Debug, Clone)]
pub struct Playbook {
    pub name: Option<String>,
    pub version: Option<String>,
    pub settings: PlaybookSettings,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    name: String,
    #[serde(default)]
    command: String,
    target: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    name: Option<String>,
    version: Option<serde_yaml::Value>,
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    settings: PlaybookSettings,
    username: Option<String>,
    password: Option<String>,
    key_path: Option<PathBuf>,
    #[serde(default)]
    tasks: Vec<RawTask>,
}

impl RawDocument {
    fn from_tasks(tasks: Vec<RawTask>) -> Self {
        Self {
            name: None,
            version: None,
            hosts: Vec::new(),
            settings: PlaybookSettings::default(),
            username: None,
            password: None,
            key_path: None,
            tasks,
        }
    }
}

/// Read and parse a playbook file
pub fn load_playbook_file<P: AsRef<Path>>(path: P, options: &LoadOptions) -> Result<Playbook> {
    let path = path.as_ref();
    let size = fs::metadata(path)?.len() as usize;
    if size > MAX_YAML_SIZE {
        return Err(EagleError::YamlSizeExceeded(size));
    }

    let content = fs::read_to_string(path)?;
    debug!("Loaded playbook {} ({} bytes)", path.display(), content.len());
    parse_playbook_yaml(&content, options)
}

/// Parse a playbook from YAML text
///
/// Every resulting task has passed [`Task::validate`]; an empty command or a
/// missing credential is reported here, naming the task.
pub fn parse_playbook_yaml(content: &str, options: &LoadOptions) -> Result<Playbook> {
    if content.len() > MAX_YAML_SIZE {
        return Err(EagleError::YamlSizeExceeded(content.len()));
    }

    let value: serde_yaml::Value = serde_yaml::from_str(content)?;
    let document = match value {
        serde_yaml::Value::Null => RawDocument::from_tasks(Vec::new()),
        serde_yaml::Value::Sequence(_) => RawDocument::from_tasks(serde_yaml::from_value(value)?),
        serde_yaml::Value::Mapping(_) => serde_yaml::from_value(value)?,
        _ => {
            return Err(EagleError::YamlParse(serde::de::Error::custom(
                "playbook must be a list of tasks or a document with a `tasks` list",
            )))
        }
    };

    if document.tasks.len() > MAX_TASK_COUNT {
        return Err(EagleError::TaskCountExceeded {
            count: document.tasks.len(),
            limit: MAX_TASK_COUNT,
        });
    }

    let tasks = resolve_tasks(&document, options)?;

    if tasks.len() > MAX_TASK_COUNT {
        return Err(EagleError::TaskCountExceeded {
            count: tasks.len(),
            limit: MAX_TASK_COUNT,
        });
    }

    Ok(Playbook {
        name: document.name,
        version: document.version.as_ref().and_then(version_string),
        settings: document.settings,
        tasks,
    })
}

fn version_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Turn raw entries into tasks, fanning out host-less entries over `hosts`
fn resolve_tasks(document: &RawDocument, options: &LoadOptions) -> Result<Vec<Task>> {
    let mut tasks = Vec::with_capacity(document.tasks.len());

    for raw in &document.tasks {
        let port = options
            .port_override
            .or(raw.port)
            .or(document.settings.port)
            .unwrap_or(options.default_port);

        let expanded = match (&raw.target, document.hosts.is_empty()) {
            (Some(host), _) => {
                let credential = resolve_credential(raw, document)?;
                vec![Task::remote(
                    raw.name.clone(),
                    raw.command.clone(),
                    Endpoint::new(host.trim(), port),
                    credential,
                )]
            }
            (None, true) => vec![Task::local(raw.name.clone(), raw.command.clone())],
            (None, false) => {
                let credential = resolve_credential(raw, document)?;
                document
                    .hosts
                    .iter()
                    .map(|host| {
                        Task::remote(
                            format!("{}@{}", raw.name, host),
                            raw.command.clone(),
                            Endpoint::new(host.trim(), port),
                            credential.clone(),
                        )
                    })
                    .collect()
            }
        };

        for t in &expanded {
            t.validate()?;
        }
        tasks.extend(expanded);
    }

    Ok(tasks)
}

/// Task fields first, then document fields, then the environment
fn resolve_credential(raw: &RawTask, document: &RawDocument) -> Result<Credential> {
    let username = raw
        .username
        .clone()
        .or_else(|| document.username.clone())
        .or_else(|| std::env::var("USER").ok())
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| EagleError::MissingCredential {
            task: raw.name.clone(),
            missing: "username",
        })?;

    if let Some(password) = &raw.password {
        return Ok(Credential::password(username, password.clone()));
    }
    if let Some(key_path) = &raw.key_path {
        return Ok(Credential::key_file(username, expand_home(key_path)));
    }
    if let Some(password) = &document.password {
        return Ok(Credential::password(username, password.clone()));
    }
    if let Some(key_path) = &document.key_path {
        return Ok(Credential::key_file(username, expand_home(key_path)));
    }

    default_key_path()
        .map(|path| Credential::key_file(username, path))
        .ok_or_else(|| EagleError::MissingCredential {
            task: raw.name.clone(),
            missing: "password or key_path",
        })
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn default_key_path() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".ssh").join("id_rsa"))
}

/// `~/x` → `$HOME/x`; anything else unchanged
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Keep only tasks targeting one of `hosts`; an empty filter keeps everything
pub fn filter_hosts(tasks: Vec<Task>, hosts: &[String]) -> Result<Vec<Task>> {
    if hosts.is_empty() {
        return Ok(tasks);
    }

    let wanted: HashSet<&str> = hosts.iter().map(String::as_str).collect();
    let kept: Vec<Task> = tasks
        .into_iter()
        .filter(|t| t.target().is_some_and(|e| wanted.contains(e.host.as_str())))
        .collect();

    if kept.is_empty() {
        return Err(EagleError::NoMatchingHosts(hosts.join(", ")));
    }
    Ok(kept)
}

/// Split a comma-separated host list, dropping blanks
pub fn parse_host_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(String::from)
        .collect()
}

/// Playbook files under `dir` whose path contains `keyword`, sorted
pub fn list_playbooks(dir: &Path, keyword: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(EagleError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        )));
    }

    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|ext| ext.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .filter(|p| p.to_string_lossy().contains(keyword))
        .collect();

    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Secret;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn parse(yaml: &str) -> Result<Playbook> {
        parse_playbook_yaml(yaml, &LoadOptions::default())
    }

    #[test]
    fn test_parse_task_list() {
        let yaml = r#"
- name: uptime
  command: uptime
  target: web1
  username: deploy
  password: secret
- name: build
  command: make
"#;
        let playbook = parse(yaml).unwrap();
        assert_eq!(playbook.tasks.len(), 2);

        let remote = &playbook.tasks[0];
        assert_eq!(remote.name(), "uptime");
        assert_eq!(remote.target(), Some(&Endpoint::new("web1", 22)));
        let credential = remote.credential().unwrap();
        assert_eq!(credential.username, "deploy");
        assert!(matches!(&credential.secret, Secret::Password(p) if p == "secret"));

        assert!(!playbook.tasks[1].is_remote());
    }

    #[test]
    fn test_parse_document_fans_out_over_hosts() {
        let yaml = r#"
name: restart-web
version: 1
hosts: [web1, web2]
username: deploy
key_path: /keys/deploy
settings:
  timeout: 60
  port: 2222
tasks:
  - name: restart
    command: systemctl restart nginx
  - name: db-check
    command: pg_isready
    target: db1
    port: 5022
"#;
        let playbook = parse(yaml).unwrap();
        assert_eq!(playbook.name.as_deref(), Some("restart-web"));
        assert_eq!(playbook.version.as_deref(), Some("1"));
        assert_eq!(playbook.settings.timeout, Some(60));

        let names: Vec<_> = playbook.tasks.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["restart@web1", "restart@web2", "db-check"]);
        assert_eq!(playbook.tasks[0].target(), Some(&Endpoint::new("web1", 2222)));
        assert_eq!(playbook.tasks[2].target(), Some(&Endpoint::new("db1", 5022)));
        assert!(matches!(
            &playbook.tasks[1].credential().unwrap().secret,
            Secret::KeyFile { path, .. } if path == Path::new("/keys/deploy")
        ));
    }

    #[test]
    fn test_task_fields_override_document() {
        let yaml = r#"
hosts: [web1]
username: deploy
password: doc-secret
tasks:
  - name: a
    command: id
    username: root
    key_path: /keys/root
"#;
        let playbook = parse(yaml).unwrap();
        let credential = playbook.tasks[0].credential().unwrap();
        assert_eq!(credential.username, "root");
        assert!(matches!(credential.secret, Secret::KeyFile { .. }));
    }

    #[test]
    fn test_port_override_wins() {
        let yaml = "- {name: a, command: id, target: web1, port: 2200, username: u, password: p}";
        let options = LoadOptions {
            default_port: 22,
            port_override: Some(8022),
        };
        let playbook = parse_playbook_yaml(yaml, &options).unwrap();
        assert_eq!(playbook.tasks[0].target().unwrap().port, 8022);
    }

    #[test]
    fn test_default_key_path() {
        if home_dir().is_none() {
            return;
        }
        let yaml = "- {name: a, command: id, target: web1, username: deploy}";
        let playbook = parse(yaml).unwrap();
        assert!(matches!(
            &playbook.tasks[0].credential().unwrap().secret,
            Secret::KeyFile { path, .. } if path.ends_with(".ssh/id_rsa")
        ));
    }

    #[test]
    fn test_empty_command_names_task() {
        let yaml = "- {name: broken, command: '  '}";
        let err = parse(yaml).unwrap_err();
        assert!(matches!(&err, EagleError::InvalidTask { name, .. } if name == "broken"));
        assert!(err.to_string().contains("broken"));

        let missing = parse("- {name: nocommand}").unwrap_err();
        assert!(matches!(missing, EagleError::InvalidTask { .. }));
    }

    #[test]
    fn test_empty_playbook() {
        assert!(parse("").unwrap().tasks.is_empty());
        assert!(parse("[]").unwrap().tasks.is_empty());
        assert!(parse("name: nothing\ntasks: []").unwrap().tasks.is_empty());
    }

    #[test]
    fn test_scalar_playbook_rejected() {
        assert!(matches!(parse("42"), Err(EagleError::YamlParse(_))));
    }

    #[test]
    fn test_yaml_size_limit() {
        let large = "# padding\n".repeat(MAX_YAML_SIZE / 10 + 1);
        assert!(matches!(
            parse(&large),
            Err(EagleError::YamlSizeExceeded(_))
        ));
    }

    #[test]
    fn test_task_count_limit_after_fan_out() {
        let hosts: Vec<String> = (0..11).map(|i| format!("h{}", i)).collect();
        let mut yaml = format!("hosts: [{}]\nusername: u\npassword: p\ntasks:\n", hosts.join(", "));
        for i in 0..100 {
            yaml.push_str(&format!("  - {{name: t{}, command: 'true'}}\n", i));
        }
        assert!(matches!(
            parse(&yaml),
            Err(EagleError::TaskCountExceeded { count: 1100, .. })
        ));
    }

    #[test]
    fn test_load_playbook_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "- name: hello\n  command: echo hello").unwrap();
        let playbook = load_playbook_file(file.path(), &LoadOptions::default()).unwrap();
        assert_eq!(playbook.tasks[0].command(), "echo hello");
    }

    #[test]
    fn test_filter_hosts() {
        let credential = Credential::password("u", "p");
        let tasks = vec![
            Task::remote("a", "id", Endpoint::new("web1", 22), credential.clone()),
            Task::remote("b", "id", Endpoint::new("web2", 22), credential),
            Task::local("c", "id"),
        ];

        let all = filter_hosts(tasks.clone(), &[]).unwrap();
        assert_eq!(all.len(), 3);

        let some = filter_hosts(tasks.clone(), &["web2".to_string()]).unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].name(), "b");

        assert!(matches!(
            filter_hosts(tasks, &["db9".to_string()]),
            Err(EagleError::NoMatchingHosts(_))
        ));
    }

    #[test]
    fn test_parse_host_list() {
        assert_eq!(parse_host_list(" web1, ,web2 "), vec!["web1", "web2"]);
        assert!(parse_host_list("").is_empty());
    }

    #[test]
    fn test_list_playbooks() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("web");
        fs::create_dir(&nested).unwrap();
        fs::write(dir.path().join("deploy.yaml"), "[]").unwrap();
        fs::write(nested.join("restart.yml"), "[]").unwrap();
        fs::write(nested.join("notes.txt"), "").unwrap();

        let all = list_playbooks(dir.path(), "").unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].ends_with("deploy.yaml"));
        assert!(all[1].ends_with("web/restart.yml"));

        let filtered = list_playbooks(dir.path(), "restart").unwrap();
        assert_eq!(filtered.len(), 1);

        assert!(list_playbooks(&dir.path().join("missing"), "").is_err());
    }
}
