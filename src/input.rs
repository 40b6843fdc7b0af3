//! Input deck parsing and validation.
//!
//! Decks are YAML files whose numeric fields may be meval expressions,
//! evaluated against the deck's `constants:` block plus a set of built-in
//! plasma-related helpers. Several decks may be passed on the command line;
//! later files override earlier ones section by section.

use std::path::Path;
use std::sync::Arc;

use yaml_rust::{yaml::Yaml, YamlLoader};

use crate::constants::*;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid input file: {0}\nUsage: mpirun -n np ./beryl deck.yml [deck2.yml ...]")]
    InvalidInputFile(String),
    #[error("unable to parse '{0}' = '{1}' in configuration file")]
    CouldNotParse(String, String),
    #[error("unable to find '{1}' in section '{0}' with correct type in configuration file")]
    MissingField(String, String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loaded deck(s), queried for typed parameters.
pub struct Configuration {
    decks: Vec<Yaml>,
    constants: Arc<Vec<(String, f64)>>,
}

impl Configuration {
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Configuration, ConfigError> {
        if paths.is_empty() {
            return Err(ConfigError::InvalidInputFile("no file supplied".to_owned()));
        }
        let mut decks = Vec::new();
        for path in paths {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::InvalidInputFile(format!("{}: {}", path.as_ref().display(), e)))?;
            let mut docs = YamlLoader::load_from_str(&contents)
                .map_err(|e| ConfigError::InvalidInputFile(format!("{}: {}", path.as_ref().display(), e)))?;
            if docs.is_empty() {
                return Err(ConfigError::InvalidInputFile(format!("{}: empty document", path.as_ref().display())));
            }
            decks.push(docs.remove(0));
        }

        let mut cfg = Configuration { decks, constants: Arc::new(Vec::new()) };
        cfg.load_constants();
        Ok(cfg)
    }

    #[cfg(test)]
    pub fn from_str(s: &str) -> Result<Configuration, ConfigError> {
        let mut docs = YamlLoader::load_from_str(s)
            .map_err(|e| ConfigError::InvalidInputFile(e.to_string()))?;
        if docs.is_empty() {
            return Err(ConfigError::InvalidInputFile("empty document".to_owned()));
        }
        let mut cfg = Configuration { decks: vec![docs.remove(0)], constants: Arc::new(Vec::new()) };
        cfg.load_constants();
        Ok(cfg)
    }

    /// Collect the `constants:` block. A constant may be an expression in
    /// terms of the built-in context and previously defined constants.
    fn load_constants(&mut self) {
        let mut consts: Vec<(String, f64)> = Vec::new();
        for deck in &self.decks {
            if let Some(hash) = deck["constants"].as_hash() {
                for (a, b) in hash {
                    let value = match b {
                        Yaml::Real(v) => v.parse::<f64>().ok(),
                        Yaml::Integer(i) => Some(*i as f64),
                        Yaml::String(v) => v
                            .parse::<meval::Expr>()
                            .ok()
                            .and_then(|e| e.eval_with_context(&base_context(&consts)).ok()),
                        _ => None,
                    };
                    if let (Yaml::String(s), Some(num)) = (a, value) {
                        consts.retain(|(n, _)| n != s);
                        consts.push((s.clone(), num));
                    }
                }
            }
        }
        self.constants = Arc::new(consts);
    }

    pub fn constants(&self) -> Arc<Vec<(String, f64)>> {
        self.constants.clone()
    }

    /// Look up `section.field`, later decks taking precedence.
    fn node(&self, section: &str, field: &str) -> &Yaml {
        for deck in self.decks.iter().rev() {
            let node = &deck[section][field];
            if !node.is_badvalue() {
                return node;
            }
        }
        &Yaml::BadValue
    }

    pub fn section(&self, section: &str) -> &Yaml {
        for deck in self.decks.iter().rev() {
            let node = &deck[section];
            if !node.is_badvalue() {
                return node;
            }
        }
        &Yaml::BadValue
    }

    pub fn real(&self, section: &str, field: &str) -> Result<f64, ConfigError> {
        eval_node(self.node(section, field), &self.constants)
            .ok_or_else(|| ConfigError::MissingField(section.to_owned(), field.to_owned()))
    }

    pub fn real_or(&self, section: &str, field: &str, default: f64) -> Result<f64, ConfigError> {
        match self.node(section, field) {
            Yaml::BadValue => Ok(default),
            node => eval_node(node, &self.constants)
                .ok_or_else(|| ConfigError::CouldNotParse(field.to_owned(), format!("{:?}", node))),
        }
    }

    pub fn integer(&self, section: &str, field: &str) -> Result<i64, ConfigError> {
        match self.node(section, field) {
            Yaml::Integer(i) => Ok(*i),
            _ => Err(ConfigError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn integer_or(&self, section: &str, field: &str, default: i64) -> Result<i64, ConfigError> {
        match self.node(section, field) {
            Yaml::Integer(i) => Ok(*i),
            Yaml::BadValue => Ok(default),
            node => Err(ConfigError::CouldNotParse(field.to_owned(), format!("{:?}", node))),
        }
    }

    pub fn bool_or(&self, section: &str, field: &str, default: bool) -> Result<bool, ConfigError> {
        match self.node(section, field) {
            Yaml::Boolean(b) => Ok(*b),
            Yaml::BadValue => Ok(default),
            node => Err(ConfigError::CouldNotParse(field.to_owned(), format!("{:?}", node))),
        }
    }

    pub fn string(&self, section: &str, field: &str) -> Result<String, ConfigError> {
        match self.node(section, field) {
            Yaml::String(s) => Ok(s.clone()),
            _ => Err(ConfigError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    /// A list of reals (expressions allowed), one entry per axis.
    pub fn reals(&self, section: &str, field: &str) -> Result<Vec<f64>, ConfigError> {
        match self.node(section, field) {
            Yaml::Array(items) => items
                .iter()
                .map(|it| {
                    eval_node(it, &self.constants)
                        .ok_or_else(|| ConfigError::CouldNotParse(field.to_owned(), format!("{:?}", it)))
                })
                .collect(),
            node => eval_node(node, &self.constants)
                .map(|v| vec![v])
                .ok_or_else(|| ConfigError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn usizes(&self, section: &str, field: &str) -> Result<Vec<usize>, ConfigError> {
        match self.node(section, field) {
            Yaml::Array(items) => items
                .iter()
                .map(|it| match it {
                    Yaml::Integer(i) if *i >= 0 => Ok(*i as usize),
                    _ => Err(ConfigError::CouldNotParse(field.to_owned(), format!("{:?}", it))),
                })
                .collect(),
            Yaml::Integer(i) if *i >= 0 => Ok(vec![*i as usize]),
            _ => Err(ConfigError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn profile(&self, section: &str, field: &str) -> Result<Profile, ConfigError> {
        Profile::from_node(self.node(section, field), &self.constants)
            .ok_or_else(|| ConfigError::MissingField(section.to_owned(), field.to_owned()))
    }

    pub fn profile_or_constant(&self, section: &str, field: &str, default: f64) -> Result<Profile, ConfigError> {
        match self.node(section, field) {
            Yaml::BadValue => Ok(Profile::constant(default)),
            node => Profile::from_node(node, &self.constants)
                .ok_or_else(|| ConfigError::CouldNotParse(field.to_owned(), format!("{:?}", node))),
        }
    }

    /// Time selection: absent -> Never, integer N -> every N steps,
    /// list -> those exact steps.
    pub fn time_selection(&self, section: &str, field: &str) -> Result<TimeSelection, ConfigError> {
        match self.node(section, field) {
            Yaml::BadValue => Ok(TimeSelection::Never),
            Yaml::Integer(i) if *i > 0 => Ok(TimeSelection::Every(*i as usize)),
            Yaml::Array(items) => {
                let steps: Option<Vec<usize>> = items
                    .iter()
                    .map(|it| match it {
                        Yaml::Integer(i) if *i >= 0 => Some(*i as usize),
                        _ => None,
                    })
                    .collect();
                steps
                    .map(TimeSelection::Explicit)
                    .ok_or_else(|| ConfigError::CouldNotParse(field.to_owned(), "time selection".to_owned()))
            }
            node => Err(ConfigError::CouldNotParse(field.to_owned(), format!("{:?}", node))),
        }
    }
}

/// Built-in evaluation context: physical shorthands and profile helpers,
/// plus the deck's own constants.
fn base_context(constants: &[(String, f64)]) -> meval::Context<'static> {
    let mut ctx = meval::Context::new();
    ctx.var("m", ELECTRON_MASS)
        .var("me", ELECTRON_MASS)
        .var("mp", PROTON_MASS)
        .var("c", SPEED_OF_LIGHT)
        .var("e", ELEMENTARY_CHARGE)
        .var("eV", ELEMENTARY_CHARGE)
        .var("keV", 1.0e3 * ELEMENTARY_CHARGE)
        .var("MeV", 1.0e6 * ELEMENTARY_CHARGE)
        .var("femto", 1.0e-15)
        .var("pico", 1.0e-12)
        .var("nano", 1.0e-9)
        .var("micro", 1.0e-6)
        .var("milli", 1.0e-3)
        .func3("step", |x, min, max| if x >= min && x < max { 1.0 } else { 0.0 })
        .func3("gauss", |x, mu, sigma| (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp())
        .func("critical", |omega| VACUUM_PERMITTIVITY * ELECTRON_MASS * omega.powi(2) / ELEMENTARY_CHARGE.powi(2));
    for (name, value) in constants {
        ctx.var(name.clone(), *value);
    }
    ctx
}

fn eval_node(node: &Yaml, constants: &[(String, f64)]) -> Option<f64> {
    match node {
        Yaml::Real(s) => s.parse::<f64>().ok(),
        Yaml::Integer(i) => Some(*i as f64),
        Yaml::String(s) => s
            .parse::<meval::Expr>()
            .ok()
            .and_then(|e| e.eval_with_context(&base_context(constants)).ok()),
        _ => None,
    }
}

/// A deck expression of (x, y, z, t), re-evaluated on demand.
///
/// The parsed expression is plain data, so profiles can be shared across
/// rayon workers; a fresh context is built per evaluation, which is cheap
/// relative to how rarely profiles are evaluated (loading, injection,
/// antennas, laser boundaries). Plain numbers short-circuit.
#[derive(Clone)]
pub struct Profile {
    kind: ProfileKind,
    constants: Arc<Vec<(String, f64)>>,
}

#[derive(Clone)]
enum ProfileKind {
    Constant(f64),
    Expr(meval::Expr),
}

impl Profile {
    pub fn from_node(node: &Yaml, constants: &Arc<Vec<(String, f64)>>) -> Option<Profile> {
        let kind = match node {
            Yaml::Real(s) => ProfileKind::Constant(s.parse::<f64>().ok()?),
            Yaml::Integer(i) => ProfileKind::Constant(*i as f64),
            Yaml::String(s) => {
                let expr = s.parse::<meval::Expr>().ok()?;
                // Reject anything that will not evaluate later.
                let mut ctx = base_context(constants);
                ctx.var("x", 0.0).var("y", 0.0).var("z", 0.0).var("t", 0.0)
                    .var("urand", 0.5).var("nrand", 0.0);
                expr.clone().eval_with_context(&ctx).ok()?;
                ProfileKind::Expr(expr)
            }
            _ => return None,
        };
        Some(Profile { kind, constants: constants.clone() })
    }

    pub fn constant(v: f64) -> Profile {
        Profile { kind: ProfileKind::Constant(v), constants: Arc::new(Vec::new()) }
    }

    pub fn at(&self, pos: [f64; 3]) -> f64 {
        self.at_time(pos, 0.0)
    }

    pub fn at_time(&self, pos: [f64; 3], t: f64) -> f64 {
        match &self.kind {
            ProfileKind::Constant(v) => *v,
            ProfileKind::Expr(expr) => {
                let mut ctx = base_context(&self.constants);
                ctx.var("x", pos[0]).var("y", pos[1]).var("z", pos[2]).var("t", t)
                    .var("urand", 0.5).var("nrand", 0.0);
                expr.clone().eval_with_context(&ctx).unwrap_or(0.0)
            }
        }
    }

    /// Momentum-style profiles additionally see a uniform and a normal
    /// random draw.
    pub fn at_random(&self, pos: [f64; 3], urand: f64, nrand: f64) -> f64 {
        match &self.kind {
            ProfileKind::Constant(v) => *v,
            ProfileKind::Expr(expr) => {
                let mut ctx = base_context(&self.constants);
                ctx.var("x", pos[0]).var("y", pos[1]).var("z", pos[2]).var("t", 0.0)
                    .var("urand", urand).var("nrand", nrand);
                expr.clone().eval_with_context(&ctx).unwrap_or(0.0)
            }
        }
    }
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Profile")
    }
}

/// Step predicate used by load balancing, checkpoints, collisions,
/// diagnostics and status prints.
#[derive(Clone, Debug, PartialEq)]
pub enum TimeSelection {
    Never,
    Every(usize),
    Explicit(Vec<usize>),
}

impl TimeSelection {
    pub fn the_time_is_now(&self, step: usize) -> bool {
        match self {
            TimeSelection::Never => false,
            TimeSelection::Every(n) => step > 0 && step % n == 0,
            TimeSelection::Explicit(steps) => steps.contains(&step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_feed_expressions() {
        let cfg = Configuration::from_str(
            "constants:\n  n0: 2.0\n  twice: 2*n0\ncontrol:\n  timestep: 'twice/4'\n",
        )
        .unwrap();
        assert_eq!(cfg.real("control", "timestep").unwrap(), 1.0);
    }

    #[test]
    fn missing_field_is_an_error() {
        let cfg = Configuration::from_str("control:\n  a: 1\n").unwrap();
        assert!(matches!(
            cfg.real("control", "b"),
            Err(ConfigError::MissingField(_, _))
        ));
    }

    #[test]
    fn profile_evaluates_positionally() {
        let cfg = Configuration::from_str("species:\n  density: 'step(x, 0, 10)'\n").unwrap();
        let p = cfg.profile("species", "density").unwrap();
        assert_eq!(p.at([5.0, 0.0, 0.0]), 1.0);
        assert_eq!(p.at([15.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn time_selection_predicate() {
        assert!(!TimeSelection::Never.the_time_is_now(5));
        let every = TimeSelection::Every(10);
        assert!(every.the_time_is_now(20));
        assert!(!every.the_time_is_now(0));
        assert!(!every.the_time_is_now(7));
        let explicit = TimeSelection::Explicit(vec![3, 10]);
        assert!(explicit.the_time_is_now(10));
        assert!(!explicit.the_time_is_now(4));
    }

    #[test]
    fn later_decks_override() {
        let mut docs1 = YamlLoader::load_from_str("control:\n  n_time: 10\n").unwrap();
        let mut docs2 = YamlLoader::load_from_str("control:\n  n_time: 20\n").unwrap();
        let cfg = Configuration {
            decks: vec![docs1.remove(0), docs2.remove(0)],
            constants: Arc::new(Vec::new()),
        };
        assert_eq!(cfg.integer("control", "n_time").unwrap(), 20);
    }
}
