//! Local pipeline stages: system preparation, equilibration, production
//! setup and analysis.
//!
//! Each stage is a fixed sequence of `gmx` tool invocations run inside the
//! working directory. Stages only check that what they consume exists and
//! that what they promise was produced; the physics is entirely GROMACS's.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
};

use mdchain_config::{MdParams, MdpError, MdpFile, Stage};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, process::Command};

use crate::{
    config::{AnalysisSettings, HarnessConfig},
    progress::{ProgressError, RunFiles},
    state::now_timestamp,
};

const TOPOLOGY: &str = "topol.top";
const PROCESSED: &str = "processed.gro";
const BOXED: &str = "newbox.gro";
const SOLVATED: &str = "solv.gro";
const IONIZED: &str = "solv_ions.gro";
const IONS_TPR: &str = "ions.tpr";
const NO_PBC: &str = "md_noPBC.xtc";
const RMSD: &str = "rmsd.xvg";
const GYRATE: &str = "gyrate.xvg";

/// Lines of tool stderr kept in error messages.
const STDERR_TAIL: usize = 20;

/// One `gmx <tool> <args>` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmxCommand {
    pub tool: &'static str,
    pub args: Vec<String>,
    /// Answers to the tool's interactive group prompts.
    pub stdin: Option<String>,
}

impl GmxCommand {
    fn new(tool: &'static str) -> Self {
        Self {
            tool,
            args: Vec::new(),
            stdin: None,
        }
    }

    fn arg(mut self, flag: &str, value: impl ToString) -> Self {
        self.args.push(flag.to_string());
        self.args.push(value.to_string());
        self
    }

    fn flag(mut self, flag: &str) -> Self {
        self.args.push(flag.to_string());
        self
    }

    fn stdin(mut self, answers: &[&str]) -> Self {
        let mut text = answers.join("\n");
        text.push('\n');
        self.stdin = Some(text);
        self
    }
}

impl fmt::Display for GmxCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gmx {}", self.tool)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Stage runner bound to one working directory.
#[derive(Debug, Clone)]
pub struct Pipeline {
    gmx_binary: String,
    workdir: PathBuf,
    mdp_dir: PathBuf,
    input_structure: Option<PathBuf>,
    params: MdParams,
    analysis: AnalysisSettings,
    mdrun_args: Vec<String>,
}

impl Pipeline {
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        let input_structure = config.harness.input_structure.as_ref().map(|p| {
            if p.is_relative() {
                config.workdir().join(p)
            } else {
                p.clone()
            }
        });
        Self {
            gmx_binary: config.harness.gmx_binary.clone(),
            workdir: config.workdir().to_path_buf(),
            mdp_dir: config.mdp_dir(),
            input_structure,
            params: config.md.clone(),
            analysis: config.harness.analysis.clone(),
            mdrun_args: config.job.mdrun_args.clone(),
        }
    }

    /// Use a different starting structure for the Prepare stage.
    #[must_use]
    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_structure = Some(path.into());
        self
    }

    fn path(&self, name: &str) -> PathBuf {
        self.workdir.join(name)
    }

    fn solvated(&self) -> bool {
        self.params.system.water.solvent_box().is_some()
    }

    /// Structure the Prepare stage hands to energy minimization.
    fn prepared_structure(&self) -> &'static str {
        if self.solvated() { IONIZED } else { BOXED }
    }

    fn input_arg(&self) -> String {
        self.input_structure
            .as_ref()
            .map_or_else(|| "protein.pdb".to_string(), |p| p.display().to_string())
    }

    fn mdrun(&self, deffnm: &str) -> GmxCommand {
        let mut cmd = GmxCommand::new("mdrun").arg("-deffnm", deffnm);
        cmd.args.extend(self.mdrun_args.iter().cloned());
        cmd
    }

    /// Commands of a stage, in execution order.
    #[must_use]
    pub fn plan(&self, stage: Stage) -> Vec<GmxCommand> {
        let system = &self.params.system;
        match stage {
            Stage::Prepare => {
                let mut plan = vec![
                    GmxCommand::new("pdb2gmx")
                        .arg("-f", self.input_arg())
                        .arg("-o", PROCESSED)
                        .arg("-p", TOPOLOGY)
                        .arg("-ff", &system.force_field)
                        .arg("-water", system.water)
                        .flag("-ignh"),
                    GmxCommand::new("editconf")
                        .arg("-f", PROCESSED)
                        .arg("-o", BOXED)
                        .flag("-c")
                        .arg("-d", system.box_distance)
                        .arg("-bt", system.box_type),
                ];
                if let Some(solvent) = system.water.solvent_box() {
                    plan.extend([
                        GmxCommand::new("solvate")
                            .arg("-cp", BOXED)
                            .arg("-cs", solvent)
                            .arg("-o", SOLVATED)
                            .arg("-p", TOPOLOGY),
                        GmxCommand::new("grompp")
                            .arg("-f", "ions.mdp")
                            .arg("-c", SOLVATED)
                            .arg("-p", TOPOLOGY)
                            .arg("-o", IONS_TPR),
                        GmxCommand::new("genion")
                            .arg("-s", IONS_TPR)
                            .arg("-o", IONIZED)
                            .arg("-p", TOPOLOGY)
                            .arg("-pname", &system.positive_ion)
                            .arg("-nname", &system.negative_ion)
                            .flag("-neutral")
                            .arg("-conc", system.salt_conc)
                            .stdin(&["SOL"]),
                    ]);
                }
                plan
            }
            Stage::Minimize => vec![
                GmxCommand::new("grompp")
                    .arg("-f", "minim.mdp")
                    .arg("-c", self.prepared_structure())
                    .arg("-p", TOPOLOGY)
                    .arg("-o", "em.tpr"),
                self.mdrun("em"),
            ],
            Stage::Nvt => vec![
                GmxCommand::new("grompp")
                    .arg("-f", "nvt.mdp")
                    .arg("-c", "em.gro")
                    .arg("-r", "em.gro")
                    .arg("-p", TOPOLOGY)
                    .arg("-o", "nvt.tpr"),
                self.mdrun("nvt"),
            ],
            Stage::Npt => vec![
                GmxCommand::new("grompp")
                    .arg("-f", "npt.mdp")
                    .arg("-c", "nvt.gro")
                    .arg("-r", "nvt.gro")
                    .arg("-t", "nvt.cpt")
                    .arg("-p", TOPOLOGY)
                    .arg("-o", "npt.tpr"),
                self.mdrun("npt"),
            ],
            Stage::Production => vec![
                GmxCommand::new("grompp")
                    .arg("-f", "md.mdp")
                    .arg("-c", "npt.gro")
                    .arg("-t", "npt.cpt")
                    .arg("-p", TOPOLOGY)
                    .arg("-o", "md.tpr"),
            ],
            Stage::Analysis => {
                let a = &self.analysis;
                vec![
                    GmxCommand::new("trjconv")
                        .arg("-s", "md.tpr")
                        .arg("-f", "md.xtc")
                        .arg("-o", NO_PBC)
                        .arg("-pbc", "mol")
                        .flag("-center")
                        .stdin(&[a.center_group.as_str(), a.output_group.as_str()]),
                    GmxCommand::new("rms")
                        .arg("-s", "md.tpr")
                        .arg("-f", NO_PBC)
                        .arg("-o", RMSD)
                        .arg("-tu", "ns")
                        .stdin(&[a.fit_group.as_str(), a.rms_group.as_str()]),
                    GmxCommand::new("gyrate")
                        .arg("-s", "md.tpr")
                        .arg("-f", NO_PBC)
                        .arg("-o", GYRATE)
                        .stdin(&[a.gyrate_group.as_str()]),
                ]
            }
        }
    }

    /// Parameter templates a stage renders, as `(template, rendered)` paths.
    fn mdp_files(&self, stage: Stage) -> Vec<(PathBuf, PathBuf)> {
        let names: Vec<&str> = match stage {
            Stage::Prepare if self.solvated() => vec!["ions.mdp"],
            Stage::Prepare | Stage::Analysis => Vec::new(),
            _ => stage.mdp_name().into_iter().collect(),
        };
        names
            .iter()
            .map(|name| (self.mdp_dir.join(name), self.path(name)))
            .collect()
    }

    /// Artifacts a stage consumes. All must exist before it starts.
    #[must_use]
    pub fn required_inputs(&self, stage: Stage) -> Vec<PathBuf> {
        let mut inputs: Vec<PathBuf> = self
            .mdp_files(stage)
            .into_iter()
            .map(|(template, _)| template)
            .collect();
        let produced = match stage {
            Stage::Prepare => {
                inputs.push(
                    self.input_structure
                        .clone()
                        .unwrap_or_else(|| self.path("protein.pdb")),
                );
                Vec::new()
            }
            Stage::Minimize => vec![TOPOLOGY, self.prepared_structure()],
            Stage::Nvt => vec![TOPOLOGY, "em.gro"],
            Stage::Npt => vec![TOPOLOGY, "nvt.gro", "nvt.cpt"],
            Stage::Production => vec![TOPOLOGY, "npt.gro", "npt.cpt"],
            Stage::Analysis => vec!["md.tpr", "md.xtc", "md.log"],
        };
        inputs.extend(produced.iter().map(|name| self.path(name)));
        inputs
    }

    /// Artifacts a stage must leave behind.
    #[must_use]
    pub fn outputs(&self, stage: Stage) -> Vec<PathBuf> {
        let names = match stage {
            Stage::Prepare => vec![TOPOLOGY, self.prepared_structure()],
            Stage::Minimize => vec!["em.gro"],
            Stage::Nvt => vec!["nvt.gro", "nvt.cpt"],
            Stage::Npt => vec!["npt.gro", "npt.cpt"],
            Stage::Production => vec!["md.tpr"],
            Stage::Analysis => vec![NO_PBC, RMSD, GYRATE],
        };
        names.iter().map(|name| self.path(name)).collect()
    }

    /// Render a parameter template with the stage's overrides applied.
    fn render_mdp(&self, stage: Stage, template: &Path, target: &Path) -> Result<(), PipelineError> {
        let text = std::fs::read_to_string(template)
            .map_err(|e| PipelineError::Io(template.to_path_buf(), e))?;
        let mut mdp =
            MdpFile::parse(&text).map_err(|e| PipelineError::Mdp(template.to_path_buf(), e))?;
        mdp.apply(&self.params.mdp_overrides(stage));
        std::fs::write(target, mdp.to_string())
            .map_err(|e| PipelineError::Io(target.to_path_buf(), e))?;
        tracing::debug!("Rendered {} -> {}", template.display(), target.display());
        Ok(())
    }

    /// Run one stage to completion.
    pub async fn run(&self, stage: Stage) -> Result<(), PipelineError> {
        if let Some(missing) = self.required_inputs(stage).into_iter().find(|p| !p.exists()) {
            return Err(PipelineError::MissingInput { stage, path: missing });
        }

        if stage == Stage::Analysis {
            let target = self.params.steps.md_steps;
            let snapshot = RunFiles::production(&self.workdir).snapshot()?;
            if !snapshot.is_complete(target) {
                return Err(PipelineError::Incomplete {
                    step: snapshot.step,
                    target,
                });
            }
        }

        for (template, target) in self.mdp_files(stage) {
            self.render_mdp(stage, &template, &target)?;
        }

        let log_path = self.path(&format!("{stage}.gmx.log"));
        for command in self.plan(stage) {
            tracing::info!("[{}] {}", stage, command);
            self.execute(&command, &log_path).await?;
        }

        if let Some(missing) = self.outputs(stage).into_iter().find(|p| !p.exists()) {
            return Err(PipelineError::MissingOutput { stage, path: missing });
        }
        tracing::info!("Stage {} finished", stage);
        Ok(())
    }

    async fn execute(&self, command: &GmxCommand, log_path: &Path) -> Result<(), PipelineError> {
        let mut cmd = Command::new(&self.gmx_binary);
        cmd.arg(command.tool)
            .args(&command.args)
            .current_dir(&self.workdir)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| PipelineError::Io(PathBuf::from(&self.gmx_binary), e))?;
        if let (Some(answers), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            stdin
                .write_all(answers.as_bytes())
                .await
                .map_err(|e| PipelineError::Io(PathBuf::from(&self.gmx_binary), e))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PipelineError::Io(PathBuf::from(&self.gmx_binary), e))?;

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
            .map_err(|e| PipelineError::Io(log_path.to_path_buf(), e))?;
        let header = format!("\n=== {} {} ===\n", now_timestamp(), command);
        for chunk in [header.as_bytes(), &output.stdout, &output.stderr] {
            log.write_all(chunk)
                .await
                .map_err(|e| PipelineError::Io(log_path.to_path_buf(), e))?;
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n");
            return Err(PipelineError::ExternalTool {
                tool: command.tool,
                code: output.status.code(),
                stderr: tail,
            });
        }
        Ok(())
    }
}

/// Errors from running a stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stage {stage} needs {}, which does not exist", path.display())]
    MissingInput { stage: Stage, path: PathBuf },
    #[error("gmx {tool} failed (exit code {code:?}):\n{stderr}")]
    ExternalTool {
        tool: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("I/O error on {}: {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
    #[error("bad parameter file {}: {}", .0.display(), .1)]
    Mdp(PathBuf, MdpError),
    #[error("stage {stage} did not produce {}", path.display())]
    MissingOutput { stage: Stage, path: PathBuf },
    #[error("production run is at step {step} of {target}")]
    Incomplete { step: u64, target: u64 },
    #[error("run state error: {0}")]
    Progress(#[from] ProgressError),
}

#[cfg(test)]
mod tests {
    use mdchain_config::WaterModel;
    use tempfile::tempdir;

    use super::*;

    fn pipeline(workdir: &Path) -> Pipeline {
        Pipeline {
            gmx_binary: "gmx".to_string(),
            workdir: workdir.to_path_buf(),
            mdp_dir: workdir.join("mdp"),
            input_structure: Some(workdir.join("1aki.pdb")),
            params: MdParams::default(),
            analysis: AnalysisSettings::default(),
            mdrun_args: vec!["-nb".to_string(), "gpu".to_string()],
        }
    }

    fn tools(plan: &[GmxCommand]) -> Vec<&'static str> {
        plan.iter().map(|c| c.tool).collect()
    }

    #[test]
    fn test_prepare_plan() {
        let p = pipeline(Path::new("/work"));
        let plan = p.plan(Stage::Prepare);
        assert_eq!(
            tools(&plan),
            vec!["pdb2gmx", "editconf", "solvate", "grompp", "genion"]
        );
        assert_eq!(
            plan[0].to_string(),
            "gmx pdb2gmx -f /work/1aki.pdb -o processed.gro -p topol.top \
             -ff amber99sb-ildn -water tip3p -ignh"
        );
        assert!(plan[1].args.contains(&"dodecahedron".to_string()));
        assert!(plan[2].args.contains(&"spc216.gro".to_string()));
        assert_eq!(plan[4].stdin.as_deref(), Some("SOL\n"));
        assert!(plan[4].args.contains(&"-neutral".to_string()));
    }

    #[test]
    fn test_prepare_without_water_skips_solvation() {
        let mut p = pipeline(Path::new("/work"));
        p.params.system.water = WaterModel::None;
        assert_eq!(tools(&p.plan(Stage::Prepare)), vec!["pdb2gmx", "editconf"]);
        assert_eq!(
            p.outputs(Stage::Prepare),
            vec![PathBuf::from("/work/topol.top"), PathBuf::from("/work/newbox.gro")]
        );
        assert_eq!(p.plan(Stage::Minimize)[0].args[3], "newbox.gro");
    }

    #[test]
    fn test_equilibration_plans() {
        let p = pipeline(Path::new("/work"));

        let nvt = p.plan(Stage::Nvt);
        assert_eq!(
            nvt[0].to_string(),
            "gmx grompp -f nvt.mdp -c em.gro -r em.gro -p topol.top -o nvt.tpr"
        );
        assert_eq!(nvt[1].to_string(), "gmx mdrun -deffnm nvt -nb gpu");

        let npt = p.plan(Stage::Npt);
        assert!(npt[0].to_string().contains("-t nvt.cpt"));

        // the long run belongs to the controller
        let production = p.plan(Stage::Production);
        assert_eq!(tools(&production), vec!["grompp"]);
        assert!(production[0].to_string().ends_with("-o md.tpr"));
    }

    #[test]
    fn test_analysis_plan_answers_prompts() {
        let p = pipeline(Path::new("/work"));
        let plan = p.plan(Stage::Analysis);
        assert_eq!(tools(&plan), vec!["trjconv", "rms", "gyrate"]);
        assert_eq!(plan[0].stdin.as_deref(), Some("Protein\nSystem\n"));
        assert_eq!(plan[1].stdin.as_deref(), Some("Backbone\nBackbone\n"));
    }

    #[test]
    fn test_required_inputs() {
        let p = pipeline(Path::new("/work"));
        assert_eq!(
            p.required_inputs(Stage::Npt),
            vec![
                PathBuf::from("/work/mdp/npt.mdp"),
                PathBuf::from("/work/topol.top"),
                PathBuf::from("/work/nvt.gro"),
                PathBuf::from("/work/nvt.cpt"),
            ]
        );
        assert_eq!(
            p.required_inputs(Stage::Prepare),
            vec![
                PathBuf::from("/work/mdp/ions.mdp"),
                PathBuf::from("/work/1aki.pdb"),
            ]
        );
    }

    #[test]
    fn test_error_messages_name_the_file() {
        let io = PipelineError::Io(
            PathBuf::from("/work/nvt.mdp"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(io.to_string(), "I/O error on /work/nvt.mdp: denied");

        let mdp = PipelineError::Mdp(
            PathBuf::from("/work/mdp/md.mdp"),
            MdpError::Syntax(3, "garbage".to_string()),
        );
        assert_eq!(
            mdp.to_string(),
            "bad parameter file /work/mdp/md.mdp: mdp syntax error on line 3: \"garbage\""
        );
    }

    #[tokio::test]
    async fn test_run_reports_missing_input() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        std::fs::create_dir_all(dir.path().join("mdp")).unwrap();
        std::fs::write(dir.path().join("mdp/nvt.mdp"), "integrator = md\n").unwrap();
        std::fs::write(dir.path().join("topol.top"), "").unwrap();

        let err = p.run(Stage::Nvt).await.unwrap_err();
        match err {
            PipelineError::MissingInput { stage, path } => {
                assert_eq!(stage, Stage::Nvt);
                assert_eq!(path, dir.path().join("em.gro"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_analysis_requires_complete_run() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        std::fs::write(dir.path().join("md.tpr"), "").unwrap();
        std::fs::write(dir.path().join("md.xtc"), "").unwrap();
        std::fs::write(
            dir.path().join("md.log"),
            "           Step           Time\n          25000       50.00000\n",
        )
        .unwrap();

        let err = p.run(Stage::Analysis).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Incomplete {
                step: 25_000,
                target: 5_000_000
            }
        ));
    }

    #[test]
    fn test_render_mdp_applies_overrides() {
        let dir = tempdir().unwrap();
        let mut p = pipeline(dir.path());
        p.params.steps.nvt_steps = 1234;
        let template = dir.path().join("template.mdp");
        std::fs::write(
            &template,
            "; NVT\nintegrator = md\nnsteps = 50000\ntc-grps = Protein Non-Protein\nref_t = 300 300\n",
        )
        .unwrap();
        let target = dir.path().join("nvt.mdp");

        p.render_mdp(Stage::Nvt, &template, &target).unwrap();
        let rendered = MdpFile::parse(&std::fs::read_to_string(&target).unwrap()).unwrap();
        assert_eq!(rendered.get("nsteps"), Some("1234"));
        assert_eq!(rendered.get("ref-t"), Some("300 300"));
        assert_eq!(rendered.get("integrator"), Some("md"));
    }

    #[tokio::test]
    #[ignore = "spawns subprocesses"]
    async fn test_execute_reports_tool_failure() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let script = dir.path().join("gmx");
        std::fs::write(&script, "#!/bin/sh\necho \"Fatal error: $1\" >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut p = pipeline(dir.path());
        p.gmx_binary = script.display().to_string();
        let err = p
            .execute(&GmxCommand::new("editconf"), &dir.path().join("x.log"))
            .await
            .unwrap_err();
        match err {
            PipelineError::ExternalTool { tool, code, stderr } => {
                assert_eq!(tool, "editconf");
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "Fatal error: editconf");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
