//! Language server bootstrapping
//!
//! Makes sure a runnable server entry point exists on disk, downloading,
//! installing and building it as needed, and returns how to launch it. The
//! entry-point script's existence is the only thing that counts as "installed".

pub mod fetch;
pub mod runner;

pub use fetch::{ArchiveFetcher, HttpArchiveFetcher};
pub use runner::{CommandRunner, CommandSpec, StreamingCommandRunner};

use crate::config::{DependencyDescriptor, ServerProfile};
use crate::logging::LogSink;
use crate::types::LspError;
use path_clean::PathClean;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How to launch an installed server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
}

impl LaunchSpec {
    /// Quoted command line for logs
    pub fn display(&self) -> String {
        let mut line = format!("\"{}\"", self.command.display());
        for (i, arg) in self.args.iter().enumerate() {
            if i == 0 {
                line.push_str(&format!(" \"{}\"", arg));
            } else {
                line.push(' ');
                line.push_str(arg);
            }
        }
        line
    }
}

/// Installs a language server described by a [`DependencyDescriptor`]
pub struct Bootstrapper {
    profile: ServerProfile,

    /// Directory archives are extracted into (one per language)
    install_root: PathBuf,

    fetcher: Arc<dyn ArchiveFetcher>,
    runner: Arc<dyn CommandRunner>,
    logger: Arc<dyn LogSink>,
}

impl Bootstrapper {
    pub fn new(
        profile: ServerProfile,
        install_root: PathBuf,
        fetcher: Arc<dyn ArchiveFetcher>,
        runner: Arc<dyn CommandRunner>,
        logger: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            profile,
            install_root,
            fetcher,
            runner,
            logger,
        }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Guarantee the entry point exists and return its launch spec
    ///
    /// Returns immediately, without side effects, when any candidate
    /// extraction path already holds the entry-point script.
    pub async fn ensure_installed(
        &self,
        descriptor: &DependencyDescriptor,
        working_directory: &Path,
    ) -> Result<LaunchSpec, LspError> {
        self.logger.info(&format!(
            "Setting up {} runtime dependencies for {}",
            self.profile.name, descriptor.platform_id
        ));

        let runtime = self.locate_tool(&self.profile.runtime)?;
        let package_manager = self.locate_tool(&self.profile.package_manager)?;

        let (mut extraction_path, mut script_path) = self.resolve_paths(descriptor);
        if script_path.exists() {
            self.logger.info(&format!(
                "{} already installed. Entry point: {}",
                self.profile.name,
                script_path.display()
            ));
            return Ok(self.launch_spec(runtime, &script_path, working_directory));
        }

        self.logger.info(&format!(
            "{} entry point not found, preparing installation...",
            self.profile.name
        ));

        let primary_path = self.install_root.join(&descriptor.relative_extraction_path);
        if !primary_path.exists() {
            self.logger.info(&format!(
                "{} not found locally. Downloading archive...",
                self.profile.name
            ));
            self.logger
                .info(&format!("Download URL: {}", descriptor.url));
            tokio::fs::create_dir_all(&self.install_root).await?;
            self.fetcher
                .fetch_and_extract(&descriptor.url, &self.install_root, descriptor.archive_type)
                .await?;
        } else {
            self.logger.warn(&format!(
                "{} exists but server build output is missing",
                primary_path.display()
            ));
        }

        (extraction_path, script_path) = self.resolve_paths(descriptor);

        if !extraction_path.exists() {
            return Err(LspError::MissingExtraction(extraction_path));
        }

        for relative_dir in &descriptor.package_install_dirs {
            self.install_packages(&package_manager, &extraction_path.join(relative_dir).clean())
                .await?;
        }

        if !script_path.exists() {
            if let Some(compile_command) = &descriptor.compile_command {
                let compile_dir = extraction_path
                    .join(&descriptor.compile_working_directory)
                    .clean();
                self.compile(compile_command, &compile_dir).await?;
            }
        }

        if !script_path.exists() {
            return Err(LspError::EntryPointNotFound(script_path));
        }

        self.logger.info(&format!(
            "{} ready. Entry point: {}",
            self.profile.name,
            script_path.display()
        ));
        Ok(self.launch_spec(runtime, &script_path, working_directory))
    }

    /// Resolve a tool on `PATH`, honoring `PATHEXT` on Windows (`npm.cmd`)
    fn locate_tool(&self, tool: &str) -> Result<PathBuf, LspError> {
        which::which(tool).map_err(|_| LspError::ToolNotFound {
            tool: tool.to_string(),
        })
    }

    /// First candidate extraction path whose script exists, else the primary one
    fn resolve_paths(&self, descriptor: &DependencyDescriptor) -> (PathBuf, PathBuf) {
        for relative_path in descriptor.candidate_extraction_paths() {
            let extraction_path = self.install_root.join(relative_path);
            let script_path = descriptor.server_script.under(&extraction_path);
            if script_path.exists() {
                return (extraction_path, script_path);
            }
        }

        let extraction_path = self.install_root.join(&descriptor.relative_extraction_path);
        let script_path = descriptor.server_script.under(&extraction_path);
        (extraction_path, script_path)
    }

    async fn install_packages(
        &self,
        package_manager: &Path,
        install_path: &Path,
    ) -> Result<(), LspError> {
        if !install_path.is_dir() {
            return Err(LspError::MissingInstallDir(install_path.to_path_buf()));
        }

        let store = install_path.join(&self.profile.dependency_store);
        if store.is_dir() && !is_empty_dir(&store).await? {
            self.logger.info(&format!(
                "Dependencies already installed in {}, skipping.",
                install_path.display()
            ));
            return Ok(());
        }

        self.logger.info(&format!(
            "Installing dependencies in {}...",
            install_path.display()
        ));
        let command = CommandSpec::new(
            &self.profile.package_manager,
            &self.profile.install_args,
            install_path,
        )
        .with_program(package_manager);
        let code = self.runner.run(&command).await?;
        if code != Some(0) {
            let error = LspError::InstallFailed {
                dir: install_path.to_path_buf(),
                command: command.display().to_string(),
                code,
            };
            self.logger.error(&error.to_string());
            return Err(error);
        }

        self.logger
            .info(&format!("{} completed successfully.", command.display()));
        Ok(())
    }

    async fn compile(&self, compile_command: &str, compile_dir: &Path) -> Result<(), LspError> {
        if !compile_dir.is_dir() {
            return Err(LspError::MissingCompileDir(compile_dir.to_path_buf()));
        }

        self.logger.info(&format!(
            "Building {} via '{}' in {}...",
            self.profile.name,
            compile_command,
            compile_dir.display()
        ));
        let command = CommandSpec::shell(compile_command, compile_dir);
        let code = self.runner.run(&command).await?;
        if code != Some(0) {
            let error = LspError::CompileFailed {
                dir: compile_dir.to_path_buf(),
                command: compile_command.to_string(),
                code,
            };
            self.logger.error(&error.to_string());
            return Err(error);
        }

        self.logger.info(&format!(
            "{} build completed successfully.",
            self.profile.name
        ));
        Ok(())
    }

    fn launch_spec(&self, runtime: PathBuf, script: &Path, working_directory: &Path) -> LaunchSpec {
        let mut args = vec![script.display().to_string()];
        args.extend(self.profile.server_args.iter().cloned());
        LaunchSpec {
            command: runtime,
            args,
            working_directory: working_directory.to_path_buf(),
        }
    }
}

async fn is_empty_dir(path: &Path) -> Result<bool, LspError> {
    let mut entries = tokio::fs::read_dir(path).await?;
    Ok(entries.next_entry().await?.is_none())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{ArchiveType, DependencyCatalog};
    use crate::logging::MemorySink;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Fetch { url: String, destination: PathBuf },
        Run { command: String, cwd: PathBuf },
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    /// Fetcher that "extracts" by writing the given files below the destination
    struct FakeFetcher {
        events: Events,
        files: Vec<&'static str>,
    }

    #[async_trait]
    impl ArchiveFetcher for FakeFetcher {
        async fn fetch_and_extract(
            &self,
            url: &str,
            destination: &Path,
            _archive_type: ArchiveType,
        ) -> Result<(), LspError> {
            self.events.lock().unwrap().push(Event::Fetch {
                url: url.to_string(),
                destination: destination.to_path_buf(),
            });
            for file in &self.files {
                touch(&destination.join(file));
            }
            Ok(())
        }
    }

    /// Runner that records commands, creates files, and exits with a fixed code
    ///
    /// A command whose display matches `fails` exits with that code instead.
    struct FakeRunner {
        events: Events,
        creates: Vec<&'static str>,
        exit_code: Option<i32>,
        fails: Option<(&'static str, Option<i32>)>,
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, command: &CommandSpec) -> Result<Option<i32>, LspError> {
            self.events.lock().unwrap().push(Event::Run {
                command: command.display().to_string(),
                cwd: command.cwd.clone(),
            });
            if let Some((failing, code)) = self.fails {
                if command.display() == failing {
                    return Ok(code);
                }
            }
            for file in &self.creates {
                touch(&command.cwd.join(file));
            }
            Ok(self.exit_code)
        }
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    fn descriptor(json: &str) -> DependencyDescriptor {
        let content = format!(r#"{{"runtimeDependencies": [{}]}}"#, json);
        DependencyCatalog::from_json(&content)
            .unwrap()
            .resolve("linux-x64")
            .unwrap()
            .clone()
    }

    fn basic_descriptor() -> DependencyDescriptor {
        descriptor(
            r#"{
                "platformId": "linux-x64",
                "url": "https://example.com/server.zip",
                "archiveType": "zip",
                "relative_extraction_path": "server",
                "legacyRelativeExtractionPaths": ["server-legacy"],
                "serverScript": "out/server.js",
                "npmInstallDirs": ["."],
                "compileCommand": null
            }"#,
        )
    }

    struct Fixture {
        root: TempDir,
        events: Events,
        bootstrapper: Bootstrapper,
    }

    fn fixture(
        fetched_files: Vec<&'static str>,
        runner_creates: Vec<&'static str>,
        exit_code: Option<i32>,
    ) -> Fixture {
        failing_fixture(fetched_files, runner_creates, exit_code, None)
    }

    fn failing_fixture(
        fetched_files: Vec<&'static str>,
        runner_creates: Vec<&'static str>,
        exit_code: Option<i32>,
        fails: Option<(&'static str, Option<i32>)>,
    ) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let mut profile = ServerProfile::node("test", "test-server");
        // any executables present on PATH will do
        profile.runtime = "sh".to_string();
        profile.package_manager = "sh".to_string();

        let bootstrapper = Bootstrapper::new(
            profile,
            root.path().join("cache"),
            Arc::new(FakeFetcher {
                events: events.clone(),
                files: fetched_files,
            }),
            Arc::new(FakeRunner {
                events: events.clone(),
                creates: runner_creates,
                exit_code,
                fails,
            }),
            Arc::new(MemorySink::new()),
        );

        Fixture {
            root,
            events,
            bootstrapper,
        }
    }

    fn events(fixture: &Fixture) -> Vec<Event> {
        fixture.events.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_cold_install_fetches_installs_and_launches() {
        let fx = fixture(
            vec!["server/package.json"],
            vec!["node_modules/dep/index.js", "out/server.js"],
            Some(0),
        );
        let workspace = fx.root.path().join("workspace");

        let spec = fx
            .bootstrapper
            .ensure_installed(&basic_descriptor(), &workspace)
            .await
            .unwrap();

        let cache = fx.root.path().join("cache");
        assert_eq!(
            events(&fx),
            vec![
                Event::Fetch {
                    url: "https://example.com/server.zip".to_string(),
                    destination: cache.clone(),
                },
                Event::Run {
                    command: "sh install".to_string(),
                    cwd: cache.join("server"),
                },
            ]
        );
        assert_eq!(
            spec.args,
            vec![
                cache.join("server/out/server.js").display().to_string(),
                "--stdio".to_string()
            ]
        );
        assert_eq!(spec.working_directory, workspace);
        assert!(spec.command.ends_with("sh"));
    }

    #[tokio::test]
    async fn test_second_call_is_side_effect_free() {
        let fx = fixture(
            vec!["server/package.json"],
            vec!["node_modules/dep/index.js", "out/server.js"],
            Some(0),
        );
        let workspace = fx.root.path().to_path_buf();
        let descriptor = basic_descriptor();

        let first = fx
            .bootstrapper
            .ensure_installed(&descriptor, &workspace)
            .await
            .unwrap();
        let events_after_first = events(&fx).len();

        let second = fx
            .bootstrapper
            .ensure_installed(&descriptor, &workspace)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(events(&fx).len(), events_after_first);
    }

    #[tokio::test]
    async fn test_legacy_layout_used_without_install() {
        let fx = fixture(vec![], vec![], Some(0));
        touch(&fx.root.path().join("cache/server-legacy/out/server.js"));

        let spec = fx
            .bootstrapper
            .ensure_installed(&basic_descriptor(), fx.root.path())
            .await
            .unwrap();

        assert!(events(&fx).is_empty());
        assert!(spec.args[0].ends_with("server-legacy/out/server.js"));
    }

    #[tokio::test]
    async fn test_existing_directory_is_not_downloaded_again() {
        let fx = fixture(vec![], vec!["out/server.js"], Some(0));
        touch(&fx.root.path().join("cache/server/package.json"));

        fx.bootstrapper
            .ensure_installed(&basic_descriptor(), fx.root.path())
            .await
            .unwrap();

        let events = events(&fx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Run { .. }));
    }

    #[tokio::test]
    async fn test_populated_dependency_store_skips_install() {
        let fx = fixture(vec![], vec![], Some(0));
        touch(&fx.root.path().join("cache/server/node_modules/dep/index.js"));

        let result = fx
            .bootstrapper
            .ensure_installed(&basic_descriptor(), fx.root.path())
            .await;

        assert!(events(&fx).is_empty());
        assert!(matches!(result, Err(LspError::EntryPointNotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_extraction() {
        // fetch "succeeds" but writes nothing
        let fx = fixture(vec![], vec![], Some(0));

        let result = fx
            .bootstrapper
            .ensure_installed(&basic_descriptor(), fx.root.path())
            .await;

        match result {
            Err(LspError::MissingExtraction(path)) => {
                assert_eq!(path, fx.root.path().join("cache/server"));
            }
            other => panic!("expected MissingExtraction, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_install_dir() {
        let fx = fixture(vec!["server/package.json"], vec![], Some(0));
        let descriptor = descriptor(
            r#"{
                "platformId": "linux-x64",
                "url": "https://example.com/server.zip",
                "archiveType": "zip",
                "relative_extraction_path": "server",
                "serverScript": "out/server.js",
                "npmInstallDirs": ["client"]
            }"#,
        );

        let result = fx
            .bootstrapper
            .ensure_installed(&descriptor, fx.root.path())
            .await;

        assert!(matches!(result, Err(LspError::MissingInstallDir(p)) if p.ends_with("server/client")));
    }

    #[tokio::test]
    async fn test_install_failure_carries_directory_and_code() {
        let fx = fixture(vec!["server/package.json"], vec![], Some(1));

        let result = fx
            .bootstrapper
            .ensure_installed(&basic_descriptor(), fx.root.path())
            .await;

        match result {
            Err(LspError::InstallFailed { dir, code, .. }) => {
                assert_eq!(dir, fx.root.path().join("cache/server"));
                assert_eq!(code, Some(1));
            }
            other => panic!("expected InstallFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compile_runs_when_script_still_missing() {
        let fx = fixture(
            vec!["server/package.json", "server/packages/ls/tsconfig.json"],
            vec!["node_modules/dep/index.js", "out/server.js"],
            Some(0),
        );
        let descriptor = descriptor(
            r#"{
                "platformId": "linux-x64",
                "url": "https://example.com/server.zip",
                "archiveType": "zip",
                "relative_extraction_path": "server",
                "serverScript": "packages/ls/out/server.js",
                "npmInstallDirs": ["."],
                "compileCommand": "npm run build",
                "compileWorkingDirectory": "packages/ls"
            }"#,
        );

        fx.bootstrapper
            .ensure_installed(&descriptor, fx.root.path())
            .await
            .unwrap();

        let events = events(&fx);
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            Event::Run {
                command: "npm run build".to_string(),
                cwd: fx.root.path().join("cache/server/packages/ls"),
            }
        );
    }

    #[tokio::test]
    async fn test_missing_compile_dir() {
        let fx = fixture(
            vec!["server/package.json"],
            vec!["node_modules/dep/index.js"],
            Some(0),
        );
        let descriptor = descriptor(
            r#"{
                "platformId": "linux-x64",
                "url": "https://example.com/server.zip",
                "archiveType": "zip",
                "relative_extraction_path": "server",
                "serverScript": "out/server.js",
                "npmInstallDirs": ["."],
                "compileCommand": "npm run build",
                "compileWorkingDirectory": "build"
            }"#,
        );

        let result = fx
            .bootstrapper
            .ensure_installed(&descriptor, fx.root.path())
            .await;

        assert!(matches!(result, Err(LspError::MissingCompileDir(_))));
    }

    #[tokio::test]
    async fn test_missing_runtime() {
        let mut fx = fixture(vec![], vec![], Some(0));
        fx.bootstrapper.profile.runtime = "lspboot-no-such-runtime".to_string();

        let result = fx
            .bootstrapper
            .ensure_installed(&basic_descriptor(), fx.root.path())
            .await;

        assert!(matches!(result, Err(LspError::ToolNotFound { tool }) if tool == "lspboot-no-such-runtime"));
        assert!(events(&fx).is_empty());
    }

    #[tokio::test]
    async fn test_missing_package_manager_fails_before_download() {
        let mut fx = fixture(vec!["server/package.json"], vec![], Some(0));
        fx.bootstrapper.profile.package_manager = "lspboot-no-such-npm".to_string();

        let result = fx
            .bootstrapper
            .ensure_installed(&basic_descriptor(), fx.root.path())
            .await;

        assert!(matches!(result, Err(LspError::ToolNotFound { tool }) if tool == "lspboot-no-such-npm"));
        assert!(events(&fx).is_empty());
    }

    #[tokio::test]
    async fn test_package_manager_runs_from_resolved_path() {
        let fx = fixture(
            vec!["server/package.json"],
            vec!["node_modules/dep/index.js", "out/server.js"],
            Some(0),
        );
        let recorded: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));

        struct PathRecorder(Arc<Mutex<Vec<PathBuf>>>);

        #[async_trait]
        impl CommandRunner for PathRecorder {
            async fn run(&self, command: &CommandSpec) -> Result<Option<i32>, LspError> {
                self.0.lock().unwrap().push(command.program.clone());
                touch(&command.cwd.join("out/server.js"));
                Ok(Some(0))
            }
        }

        let bootstrapper = Bootstrapper {
            runner: Arc::new(PathRecorder(recorded.clone())),
            ..fx.bootstrapper
        };
        bootstrapper
            .ensure_installed(&basic_descriptor(), fx.root.path())
            .await
            .unwrap();

        let programs = recorded.lock().unwrap().clone();
        assert_eq!(programs, vec![which::which("sh").unwrap()]);
    }

    #[tokio::test]
    async fn test_compile_failure_carries_directory_command_and_code() {
        let fx = failing_fixture(
            vec!["server/package.json", "server/packages/ls/tsconfig.json"],
            vec!["node_modules/dep/index.js"],
            Some(0),
            Some(("npm run build", Some(2))),
        );
        let descriptor = descriptor(
            r#"{
                "platformId": "linux-x64",
                "url": "https://example.com/server.zip",
                "archiveType": "zip",
                "relative_extraction_path": "server",
                "serverScript": "packages/ls/out/server.js",
                "npmInstallDirs": ["."],
                "compileCommand": "npm run build",
                "compileWorkingDirectory": "packages/ls"
            }"#,
        );

        let result = fx
            .bootstrapper
            .ensure_installed(&descriptor, fx.root.path())
            .await;

        match result {
            Err(LspError::CompileFailed { dir, command, code }) => {
                assert_eq!(dir, fx.root.path().join("cache/server/packages/ls"));
                assert_eq!(command, "npm run build");
                assert_eq!(code, Some(2));
            }
            other => panic!("expected CompileFailed, got {:?}", other),
        }
        // the install step ran and succeeded before the build
        assert_eq!(events(&fx).len(), 3);
    }

    #[test]
    fn test_launch_spec_display_quotes_paths() {
        let spec = LaunchSpec {
            command: PathBuf::from("/usr/bin/node"),
            args: vec!["/opt/ls/out/server.js".to_string(), "--stdio".to_string()],
            working_directory: PathBuf::from("/work"),
        };
        assert_eq!(
            spec.display(),
            "\"/usr/bin/node\" \"/opt/ls/out/server.js\" --stdio"
        );
    }
}
