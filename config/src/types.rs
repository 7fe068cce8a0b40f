//! Pipeline stage and system-building enums.

use serde::{Deserialize, Serialize};

/// A step of the simulation pipeline, in execution order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Topology generation, boxing, solvation and ion placement.
    Prepare,
    /// Steepest-descent energy minimization.
    Minimize,
    /// Constant volume/temperature equilibration.
    Nvt,
    /// Constant pressure/temperature equilibration.
    Npt,
    /// Production MD (only the run input is built here, the run itself is chained).
    Production,
    /// Trajectory post-processing.
    Analysis,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Self::Prepare,
        Self::Minimize,
        Self::Nvt,
        Self::Npt,
        Self::Production,
        Self::Analysis,
    ];

    /// The stage that follows this one, if any.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        let idx = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Default file name stem used for `-deffnm` by the stages that run `mdrun`.
    #[must_use]
    pub fn deffnm(self) -> Option<&'static str> {
        match self {
            Self::Minimize => Some("em"),
            Self::Nvt => Some("nvt"),
            Self::Npt => Some("npt"),
            Self::Production => Some("md"),
            Self::Prepare | Self::Analysis => None,
        }
    }

    /// Parameter file consumed by `grompp` in this stage.
    #[must_use]
    pub fn mdp_name(self) -> Option<&'static str> {
        match self {
            Self::Prepare => Some("ions.mdp"),
            Self::Minimize => Some("minim.mdp"),
            Self::Nvt => Some("nvt.mdp"),
            Self::Npt => Some("npt.mdp"),
            Self::Production => Some("md.mdp"),
            Self::Analysis => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Minimize => write!(f, "minimize"),
            Self::Nvt => write!(f, "nvt"),
            Self::Npt => write!(f, "npt"),
            Self::Production => write!(f, "production"),
            Self::Analysis => write!(f, "analysis"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prepare" | "prep" => Ok(Self::Prepare),
            "minimize" | "minimise" | "em" => Ok(Self::Minimize),
            "nvt" => Ok(Self::Nvt),
            "npt" => Ok(Self::Npt),
            "production" | "md" => Ok(Self::Production),
            "analysis" => Ok(Self::Analysis),
            _ => Err(format!(
                "unknown stage '{s}'. Use: prepare, minimize, nvt, npt, production, analysis"
            )),
        }
    }
}

/// Water model passed to `pdb2gmx -water`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum WaterModel {
    #[default]
    Tip3p,
    Tip4p,
    Spc,
    Spce,
    None,
}

impl WaterModel {
    /// Pre-equilibrated solvent configuration for `solvate -cs`.
    #[must_use]
    pub fn solvent_box(self) -> Option<&'static str> {
        match self {
            Self::Tip3p | Self::Spc | Self::Spce => Some("spc216.gro"),
            Self::Tip4p => Some("tip4p.gro"),
            Self::None => None,
        }
    }
}

impl std::fmt::Display for WaterModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tip3p => write!(f, "tip3p"),
            Self::Tip4p => write!(f, "tip4p"),
            Self::Spc => write!(f, "spc"),
            Self::Spce => write!(f, "spce"),
            Self::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for WaterModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tip3p" => Ok(Self::Tip3p),
            "tip4p" => Ok(Self::Tip4p),
            "spc" => Ok(Self::Spc),
            "spce" | "spc/e" => Ok(Self::Spce),
            "none" => Ok(Self::None),
            _ => Err(format!(
                "unknown water model '{s}'. Use: tip3p, tip4p, spc, spce, none"
            )),
        }
    }
}

/// Simulation box shape passed to `editconf -bt`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum BoxType {
    Cubic,
    #[default]
    Dodecahedron,
    Octahedron,
    Triclinic,
}

impl std::fmt::Display for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cubic => write!(f, "cubic"),
            Self::Dodecahedron => write!(f, "dodecahedron"),
            Self::Octahedron => write!(f, "octahedron"),
            Self::Triclinic => write!(f, "triclinic"),
        }
    }
}

impl std::str::FromStr for BoxType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cubic" => Ok(Self::Cubic),
            "dodecahedron" => Ok(Self::Dodecahedron),
            "octahedron" => Ok(Self::Octahedron),
            "triclinic" => Ok(Self::Triclinic),
            _ => Err(format!(
                "unknown box type '{s}'. Use: cubic, dodecahedron, octahedron, triclinic"
            )),
        }
    }
}
