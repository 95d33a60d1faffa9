// src/setup.rs
//! One-time host setup: PostgreSQL variant builds and the BenchBase install.
//!
//! Layout under the build root:
//!
//! ```text
//! pg_src/base            primary clone (base branch)
//! pg_src/<branch>        git worktrees of the same clone
//! pg_build/<branch>_<blk> out-of-tree build directories
//! pg_install/<branch>_<blk>
//! benchbase_src/  benchbase_install/
//! ```

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{HarnessConfig, SourcesConfig};
use crate::constants;
use crate::error::HarnessError;
use crate::remote::{shell_quote, RemoteExec};
use crate::variant::{Variant, VariantRegistry};

pub struct BuildManager<R: RemoteExec> {
    remote: R,
    registry: VariantRegistry,
    sources: SourcesConfig,
    step_timeout: Duration,
    show_progress: bool,
}

fn quote_path(p: &Path) -> String {
    shell_quote(p.to_string_lossy())
}

impl<R: RemoteExec> BuildManager<R> {
    pub fn new(remote: R, cfg: &HarnessConfig) -> Self {
        Self {
            remote,
            registry: VariantRegistry::new(cfg),
            sources: cfg.sources.clone(),
            step_timeout: constants::BUILD_STEP_TIMEOUT,
            show_progress: true,
        }
    }

    /// Disable the spinner (tests, non-interactive runs)
    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Run one build step in `cwd`; a non-zero exit becomes `HarnessError::Build`.
    fn step(&self, step: &str, cwd: &Path, command: &str) -> Result<()> {
        let full = format!("cd {} && {}", quote_path(cwd), command);
        debug!("build step `{}`: {}", step, full);
        let out = self.remote.run(&full, self.step_timeout)?;
        if !out.success() {
            debug!("{}", out.failure_reason(&full));
            return Err(HarnessError::Build {
                step: step.to_string(),
                status: out.status,
            }
            .into());
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self
            .remote
            .run(&format!("test -e {}", quote_path(path)), constants::DEFAULT_COMMAND_TIMEOUT)?
            .success())
    }

    /// Run `f` behind a spinner with `msg`
    fn with_spinner<T>(&self, msg: String, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if !self.show_progress {
            return f();
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")?);
        pb.set_message(msg);
        pb.enable_steady_tick(Duration::from_millis(120));
        let result = f();
        pb.finish_and_clear();
        result
    }

    /// Clone the base branch, then add a worktree per other branch.
    /// Existing checkouts are left alone.
    pub fn clone_sources(&self) -> Result<()> {
        let url = self.sources.postgres_git_url.as_deref().ok_or_else(|| {
            HarnessError::Configuration("sources.postgres_git_url is not set".into())
        })?;
        let root = self.registry.source_root();
        let base = self.registry.base(self.first_block_size()?)?;
        let base_src = self.registry.resolve(&base).source_path;

        if self.exists(&base_src)? {
            info!("{} already cloned", base_src.display());
        } else {
            self.remote.run_checked(
                &format!("mkdir -p {}", quote_path(&root)),
                constants::DEFAULT_COMMAND_TIMEOUT,
            )?;
            self.with_spinner(format!("cloning {} ({})", url, base.git_branch()), || {
                self.step(
                    "git clone",
                    &root,
                    &format!(
                        "git clone --branch {} {} {}",
                        shell_quote(base.git_branch()),
                        shell_quote(url),
                        quote_path(&base_src)
                    ),
                )
            })?;
        }

        for variant in self.branch_variants()? {
            if variant.is_base() {
                continue;
            }
            let src = self.registry.resolve(&variant).source_path;
            if self.exists(&src)? {
                info!("worktree {} already present", src.display());
                continue;
            }
            info!("Adding worktree for {} at {}", variant.git_branch(), src.display());
            self.step(
                "git worktree add",
                &base_src,
                &format!(
                    "git worktree add {} {}",
                    quote_path(&src),
                    shell_quote(variant.git_branch())
                ),
            )?;
        }
        Ok(())
    }

    pub fn configure(&self, variant: &Variant) -> Result<()> {
        let paths = self.registry.resolve(variant);
        info!("Configuring {} (block size {} KiB)", variant, variant.block_size());
        self.remote.run_checked(
            &format!("mkdir -p {}", quote_path(&paths.build_path)),
            constants::DEFAULT_COMMAND_TIMEOUT,
        )?;
        self.step(
            "configure",
            &paths.build_path,
            &format!(
                "{}/configure --with-blocksize={} --prefix={} --with-extra-version=_{}",
                quote_path(&paths.source_path),
                variant.block_size(),
                quote_path(&paths.install_path),
                variant
            ),
        )
    }

    /// make; make install
    pub fn build(&self, variant: &Variant) -> Result<()> {
        let build = self.registry.resolve(variant).build_path;
        self.with_spinner(format!("building {}", variant), || {
            self.step("make", &build, "make")?;
            self.step("make install", &build, "make install")
        })?;
        info!("Installed {}", variant);
        Ok(())
    }

    pub fn clean(&self, variant: &Variant) -> Result<()> {
        let build = self.registry.resolve(variant).build_path;
        info!("Cleaning {}", variant);
        self.step("make clean", &build, "make clean")
    }

    /// Clone, configure, build and install every variant
    pub fn setup_all(&self) -> Result<()> {
        self.clone_sources()?;
        for variant in self.registry.all() {
            self.configure(&variant)?;
            self.build(&variant)?;
        }
        Ok(())
    }

    /// Pull every source tree, force a rebuild of the buffer-manager sources on
    /// non-base branches, and rebuild every variant.
    pub fn update_all(&self) -> Result<()> {
        for variant in self.branch_variants()? {
            let src = self.registry.resolve(&variant).source_path;
            self.with_spinner(format!("pulling {}", variant.git_branch()), || {
                self.step("git pull", &src, "git pull")
            })?;
            if !variant.is_base() {
                let files: Vec<String> = constants::PBM_SOURCE_FILES
                    .iter()
                    .map(|f| shell_quote(f))
                    .collect();
                self.step("touch", &src, &format!("touch {}", files.join(" ")))?;
            }
        }
        for variant in self.registry.all() {
            self.build(&variant)?;
        }
        Ok(())
    }

    /// `make clean` for every non-base variant, and the base builds too when asked
    pub fn clean_all(&self, include_base: bool) -> Result<()> {
        for variant in self.registry.all() {
            if variant.is_base() && !include_base {
                continue;
            }
            self.clean(&variant)?;
        }
        Ok(())
    }

    /// Clone BenchBase, build the PostgreSQL profile and unpack it into the install directory
    pub fn setup_benchbase(&self) -> Result<()> {
        let url = self.sources.benchbase_git_url.as_deref().ok_or_else(|| {
            HarnessError::Configuration("sources.benchbase_git_url is not set".into())
        })?;
        let src = self.registry.benchbase_source();
        let install = self.registry.benchbase_install();

        if self.exists(&src)? {
            info!("{} already cloned", src.display());
        } else {
            self.with_spinner(format!("cloning {}", url), || {
                self.step(
                    "git clone",
                    self.registry.build_root(),
                    &format!("git clone {} {}", shell_quote(url), quote_path(&src)),
                )
            })?;
        }

        self.with_spinner("building BenchBase".to_string(), || {
            self.step("mvnw package", &src, "./mvnw clean package -P postgres -DskipTests")
        })?;
        self.step(
            "unpack",
            &src,
            &format!(
                "mkdir -p {dir} && tar -xzf {archive} -C {dir}",
                dir = quote_path(&install),
                archive = shell_quote(constants::BENCHBASE_ARCHIVE)
            ),
        )?;
        info!("BenchBase installed to {}", self.registry.benchbase_home().display());
        Ok(())
    }

    fn first_block_size(&self) -> Result<u32, HarnessError> {
        self.registry
            .block_sizes()
            .first()
            .copied()
            .ok_or_else(|| HarnessError::Configuration("no block sizes configured".into()))
    }

    /// One variant per branch; source trees are shared across block sizes
    fn branch_variants(&self) -> Result<Vec<Variant>> {
        let blk = self.first_block_size()?;
        self.registry
            .branch_names()
            .map(|b| self.registry.variant(b, blk).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_kind;
    use crate::test_support::{sample_config, FakeRemote};

    fn manager(remote: &FakeRemote) -> BuildManager<FakeRemote> {
        let mut cfg = sample_config();
        cfg.sources.postgres_git_url = Some("https://example.org/postgres.git".into());
        cfg.sources.benchbase_git_url = Some("https://example.org/benchbase.git".into());
        BuildManager::new(remote.clone(), &cfg).quiet()
    }

    #[test]
    fn test_clone_creates_base_then_worktrees() {
        let remote = FakeRemote::default();
        // nothing exists yet
        remote.fail_when("test -e");
        manager(&remote).clone_sources().unwrap();

        let cmds = remote.commands();
        let clone = cmds.iter().position(|c| c.contains("git clone --branch REL_14_STABLE")).unwrap();
        let wt = cmds
            .iter()
            .position(|c| c.contains("cd /build/pg_src/base && git worktree add /build/pg_src/pbm2 pbm_part2"))
            .unwrap();
        assert!(clone < wt);
    }

    #[test]
    fn test_existing_checkouts_are_kept() {
        let remote = FakeRemote::default();
        manager(&remote).clone_sources().unwrap();
        assert!(!remote.commands().iter().any(|c| c.contains("git clone") || c.contains("worktree")));
    }

    #[test]
    fn test_configure_flags() {
        let remote = FakeRemote::default();
        let m = manager(&remote);
        let v = m.registry.variant("pbm2", 32).unwrap();
        m.configure(&v).unwrap();
        let last = remote.commands().last().unwrap().clone();
        assert!(last.starts_with("cd /build/pg_build/pbm2_32 && /build/pg_src/pbm2/configure"));
        assert!(last.contains("--with-blocksize=32"));
        assert!(last.contains("--prefix=/build/pg_install/pbm2_32"));
        assert!(last.contains("--with-extra-version=_pbm2_32"));
    }

    #[test]
    fn test_failed_make_is_build_error() {
        let remote = FakeRemote::default();
        remote.fail_when("make install");
        let m = manager(&remote);
        let v = m.registry.base(8).unwrap();
        let err = m.build(&v).unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, HarnessError::Build { step, status: 1 } if step == "make install")));
    }

    #[test]
    fn test_update_touches_buffer_manager_sources_on_non_base_only() {
        let remote = FakeRemote::default();
        manager(&remote).update_all().unwrap();
        let cmds = remote.commands();
        let touches: Vec<_> = cmds.iter().filter(|c| c.contains("touch ")).collect();
        assert_eq!(touches.len(), 1);
        assert!(touches[0].starts_with("cd /build/pg_src/pbm2 && touch src/include/storage/pbm.h"));
        // 2 branches x 2 block sizes, make + make install each
        assert_eq!(cmds.iter().filter(|c| c.ends_with("&& make install")).count(), 4);
    }

    #[test]
    fn test_clean_all_skips_base_unless_asked() {
        let remote = FakeRemote::default();
        manager(&remote).clean_all(false).unwrap();
        let cleaned: Vec<_> = remote.commands().into_iter().filter(|c| c.ends_with("make clean")).collect();
        assert_eq!(cleaned.len(), 2);
        assert!(cleaned.iter().all(|c| c.contains("pbm2_")));

        let remote = FakeRemote::default();
        manager(&remote).clean_all(true).unwrap();
        assert_eq!(remote.commands().iter().filter(|c| c.ends_with("make clean")).count(), 4);
    }

    #[test]
    fn test_missing_url_is_configuration_error() {
        let remote = FakeRemote::default();
        let m = BuildManager::new(remote, &sample_config()).quiet();
        let err = m.setup_benchbase().unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, HarnessError::Configuration(_))));
    }

    #[test]
    fn test_benchbase_unpacks_archive() {
        let remote = FakeRemote::default();
        manager(&remote).setup_benchbase().unwrap();
        let last = remote.commands().last().unwrap().clone();
        assert!(last.contains("tar -xzf target/benchbase-postgres.tgz -C /build/benchbase_install"));
    }
}
