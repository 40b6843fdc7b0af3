//! Validated simulation parameters.
//!
//! `Params::read` turns the raw deck into the complete parameter record the
//! core runs on, applying every setup-time validity rule. All failures here
//! are fatal before the time loop starts.

use crate::input::{ConfigError, Configuration, Profile, TimeSelection};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GeometryKind {
    OneD,
    TwoD,
    ThreeD,
    /// Axisymmetric cylindrical: 2D (x, r) grid, 3D momenta.
    AxiSym,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EmBoundary {
    Periodic,
    Reflective,
    Absorbing,
    /// Absorbing boundary with an injected laser source (x-min only).
    Laser,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParticlePolicy {
    Reflective,
    Remove,
    Stop,
    Thermalize,
    Periodic,
    /// Axisymmetric inner radial face: no policy applies.
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PusherKind {
    Boris,
    Vay,
}

#[derive(Clone, Debug)]
pub struct SpeciesSpec {
    pub name: String,
    /// In units of the electron mass; zero flags a photon species.
    pub mass: f64,
    /// In units of the elementary charge.
    pub charge: f64,
    pub n_part_per_cell: usize,
    pub density: Profile,
    /// Momentum profiles, expressions of (x, y, z, urand, nrand).
    pub momentum: [Profile; 3],
    pub bcs: [[ParticlePolicy; 2]; 3],
    /// Thermal momentum spread used by the `thermalize` policy.
    pub thermal_momentum: f64,
    pub pusher: PusherKind,
    pub tracked: bool,
    pub radiating: bool,
    pub time_frozen: f64,
    /// Non-zero enables tunnel ionization; the species charge is then the
    /// initial charge state and particles ionize up to this number.
    pub atomic_number: usize,
    /// Species receiving the freed electrons.
    pub ionization_electrons: Option<usize>,
}

impl SpeciesSpec {
    pub fn is_photon(&self) -> bool {
        self.mass == 0.0
    }

    pub fn ionizable(&self) -> bool {
        self.atomic_number > 0 && self.ionization_electrons.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct WindowParams {
    pub t_start: f64,
    /// Shift by one cell every this many steps.
    pub every: usize,
}

#[derive(Clone, Debug)]
pub struct BalanceParams {
    pub every: TimeSelection,
    pub cost_per_particle: f64,
    pub cost_per_cell: f64,
}

#[derive(Clone, Debug)]
pub struct CheckpointParams {
    pub dump_every: TimeSelection,
    pub directory: String,
    pub restart_from: Option<String>,
    /// Wall-clock budget in seconds; the watchdog raises `exit_asap` when
    /// it is exceeded.
    pub wall_time_limit: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct CollisionParams {
    pub species_a: usize,
    pub species_b: usize,
    pub coulomb_log: f64,
    pub every: TimeSelection,
}

#[derive(Clone, Debug)]
pub struct Antenna {
    /// Current component driven (0..3 for Jx..Jz).
    pub component: usize,
    pub profile: Profile,
}

#[derive(Clone, Debug)]
pub struct ExternalField {
    /// true for E, false for B.
    pub electric: bool,
    pub component: usize,
    pub profile: Profile,
}

#[derive(Clone, Debug)]
pub struct BinningSpec {
    pub species: usize,
    /// Colon-separated quantities, e.g. "x", "energy", "x:px".
    pub spec: String,
    pub every: TimeSelection,
}

#[derive(Clone, Debug)]
pub struct DiagParams {
    pub scalars_every: TimeSelection,
    pub fields_every: TimeSelection,
    pub binning: Vec<BinningSpec>,
    pub directory: String,
}

pub struct Params {
    pub geometry: GeometryKind,
    pub ndim_field: usize,
    pub ndim_particle: usize,
    pub cell_length: [f64; 3],
    pub n_global: [usize; 3],
    pub n_per_patch: [usize; 3],
    pub n_patches_grid: [usize; 3],
    pub total_patches: usize,
    pub ghost: usize,
    pub timestep: f64,
    pub n_time: usize,
    pub time_fields_frozen: f64,
    pub em_bcs: [[EmBoundary; 2]; 3],
    pub laser: Option<Profile>,
    pub solve_poisson: bool,
    pub poisson_tolerance: f64,
    pub poisson_max_iteration: usize,
    pub print_every: usize,
    pub random_seed: u64,
    /// SI reference frequency, rad/s; required by radiating species.
    pub reference_frequency: f64,
    pub species: Vec<SpeciesSpec>,
    pub photon_species: Option<usize>,
    pub window: Option<WindowParams>,
    pub load_balancing: Option<BalanceParams>,
    pub global_factor: [usize; 3],
    pub checkpoint: CheckpointParams,
    pub collisions: Vec<CollisionParams>,
    pub antennas: Vec<Antenna>,
    pub external_fields: Vec<ExternalField>,
    pub diags: DiagParams,
}

impl Params {
    pub fn read(cfg: &Configuration) -> Result<Params, ConfigError> {
        let geometry = match cfg.string("control", "geometry")?.as_str() {
            "1d3v" => GeometryKind::OneD,
            "2d3v" => GeometryKind::TwoD,
            "3d3v" => GeometryKind::ThreeD,
            "3drz" => GeometryKind::AxiSym,
            other => return Err(ConfigError::Invalid(format!("unknown geometry '{}'", other))),
        };
        let ndim_field = match geometry {
            GeometryKind::OneD => 1,
            GeometryKind::TwoD | GeometryKind::AxiSym => 2,
            GeometryKind::ThreeD => 3,
        };
        let ndim_particle = match geometry {
            GeometryKind::AxiSym => 3,
            _ => ndim_field,
        };

        let cell_length = fixed3(&cfg.reals("control", "cell_length")?, ndim_field, "cell_length", 1.0)?;
        let n_global_v = cfg.usizes("control", "n_space_global")?;
        let n_global = fixed3u(&n_global_v, ndim_field, "n_space_global", 1)?;
        let n_per_patch_v = cfg
            .usizes("control", "n_space_per_patch")
            .unwrap_or_else(|_| n_global_v.clone());
        let n_per_patch = fixed3u(&n_per_patch_v, ndim_field, "n_space_per_patch", 1)?;

        let mut n_patches_grid = [1usize; 3];
        for d in 0..ndim_field {
            if n_per_patch[d] == 0 || n_global[d] % n_per_patch[d] != 0 {
                return Err(ConfigError::Invalid(format!(
                    "n_space_global[{}] = {} is not a multiple of n_space_per_patch[{}] = {}",
                    d, n_global[d], d, n_per_patch[d]
                )));
            }
            n_patches_grid[d] = n_global[d] / n_per_patch[d];
        }
        let total_patches: usize = n_patches_grid.iter().product();

        // CFL-stable default when no explicit timestep is given.
        let cfl_limit = 1.0
            / (0..ndim_field)
                .map(|d| cell_length[d].powi(-2))
                .sum::<f64>()
                .sqrt();
        let timestep = match cfg.real("control", "timestep") {
            Ok(dt) => dt,
            Err(_) => cfg.real_or("control", "cfl", 0.95)? * cfl_limit,
        };
        if timestep <= 0.0 || timestep > cfl_limit {
            return Err(ConfigError::Invalid(format!(
                "timestep {} violates the CFL limit {}",
                timestep, cfl_limit
            )));
        }

        let n_time = cfg.integer("control", "n_time")? as usize;

        let mut em_bcs = [[EmBoundary::Periodic; 2]; 3];
        if let yaml_rust::yaml::Yaml::Array(axes) = &cfg.section("em")["boundary_conditions"] {
            for (d, sides) in axes.iter().enumerate().take(ndim_field) {
                if let yaml_rust::yaml::Yaml::Array(pair) = sides {
                    for (s, side) in pair.iter().enumerate().take(2) {
                        em_bcs[d][s] = match side.as_str() {
                            Some("periodic") => EmBoundary::Periodic,
                            Some("reflective") => EmBoundary::Reflective,
                            Some("absorbing") => EmBoundary::Absorbing,
                            Some("laser") => EmBoundary::Laser,
                            other => {
                                return Err(ConfigError::Invalid(format!(
                                    "unknown EM boundary condition {:?}",
                                    other
                                )))
                            }
                        };
                    }
                    if em_bcs[d][0] == EmBoundary::Periodic || em_bcs[d][1] == EmBoundary::Periodic {
                        if em_bcs[d][0] != em_bcs[d][1] {
                            return Err(ConfigError::Invalid(format!(
                                "EM boundary conditions on axis {} mix periodic with non-periodic",
                                d
                            )));
                        }
                    }
                }
            }
        }
        for (d, sides) in em_bcs.iter().enumerate() {
            for (s, bc) in sides.iter().enumerate() {
                if *bc == EmBoundary::Laser && !(d == 0 && s == 0) {
                    return Err(ConfigError::Invalid(
                        "laser boundary is only supported on x-min".to_owned(),
                    ));
                }
            }
        }
        let laser = if em_bcs[0][0] == EmBoundary::Laser {
            Some(cfg.profile("em", "laser")?)
        } else {
            None
        };

        let constants = cfg.constants();
        let mut species = Vec::new();
        let mut electron_names: Vec<Option<String>> = Vec::new();
        if let yaml_rust::yaml::Yaml::Array(list) = cfg.section("species") {
            for node in list {
                let (spec, electron_name) =
                    read_species(node, &constants, ndim_field, geometry, &em_bcs)?;
                species.push(spec);
                electron_names.push(electron_name);
            }
        }
        // Resolve ionization targets once every species is known.
        for (s, electron_name) in electron_names.iter().enumerate() {
            let target_name = match electron_name {
                Some(n) => n,
                None => continue,
            };
            let target = species
                .iter()
                .position(|sp| &sp.name == target_name)
                .ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "species '{}': ionization_electrons '{}' is not a species",
                        species[s].name, target_name
                    ))
                })?;
            if target == s {
                return Err(ConfigError::Invalid(format!(
                    "species '{}' cannot be its own ionization_electrons",
                    species[s].name
                )));
            }
            if species[target].mass != 1.0 || species[target].charge != -1.0 {
                return Err(ConfigError::Invalid(format!(
                    "species '{}': ionization_electrons '{}' must be electrons (mass 1, charge -1)",
                    species[s].name, target_name
                )));
            }
            species[s].ionization_electrons = Some(target);
        }
        let photon_species = match cfg.string("radiation", "photon_species") {
            Ok(name) => {
                let idx = species
                    .iter()
                    .position(|s: &SpeciesSpec| s.name == name)
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!("photon_species '{}' is not a species", name))
                    })?;
                if !species[idx].is_photon() {
                    return Err(ConfigError::Invalid(format!(
                        "photon_species '{}' must have zero mass",
                        name
                    )));
                }
                Some(idx)
            }
            Err(_) => None,
        };
        let reference_frequency = cfg.real_or("control", "reference_frequency", 0.0)?;
        if species.iter().any(|s| s.radiating) {
            if photon_species.is_none() {
                return Err(ConfigError::Invalid(
                    "radiating species configured without radiation.photon_species".to_owned(),
                ));
            }
            if reference_frequency <= 0.0 {
                return Err(ConfigError::Invalid(
                    "radiating species require control.reference_frequency".to_owned(),
                ));
            }
        }
        if species.iter().any(|s| s.ionizable()) && reference_frequency <= 0.0 {
            return Err(ConfigError::Invalid(
                "ionizable species require control.reference_frequency".to_owned(),
            ));
        }

        let window = if cfg.bool_or("window", "active", false)? {
            Some(WindowParams {
                t_start: cfg.real_or("window", "t_start", 0.0)?,
                every: cfg.integer_or("window", "every", 1)? as usize,
            })
        } else {
            None
        };
        if window.is_some() && em_bcs[0][0] == EmBoundary::Periodic {
            return Err(ConfigError::Invalid(
                "a moving window is incompatible with periodic x boundaries".to_owned(),
            ));
        }

        let load_balancing = if cfg.bool_or("balancing", "active", false)? {
            Some(BalanceParams {
                every: cfg.time_selection("balancing", "every")?,
                cost_per_particle: cfg.real_or("balancing", "cost_per_particle", 1.0)?,
                cost_per_cell: cfg.real_or("balancing", "cost_per_cell", 0.1)?,
            })
        } else {
            None
        };

        let gf = cfg
            .usizes("control", "global_factor")
            .unwrap_or_else(|_| vec![1; ndim_field]);
        let global_factor = fixed3u(&gf, ndim_field, "global_factor", 1)?;
        for d in 0..ndim_field {
            if global_factor[d] == 0 || n_patches_grid[d] % global_factor[d] != 0 {
                return Err(ConfigError::Invalid(format!(
                    "global_factor[{}] = {} does not divide the patch grid extent {}",
                    d, global_factor[d], n_patches_grid[d]
                )));
            }
        }

        let checkpoint = CheckpointParams {
            dump_every: cfg.time_selection("checkpoint", "dump_every")?,
            directory: cfg
                .string("checkpoint", "directory")
                .unwrap_or_else(|_| ".".to_owned()),
            restart_from: cfg.string("checkpoint", "restart_from").ok(),
            wall_time_limit: cfg.real("checkpoint", "wall_time_limit").ok(),
        };

        let mut collisions = Vec::new();
        if let yaml_rust::yaml::Yaml::Array(list) = cfg.section("collisions") {
            for node in list {
                let pair_name = |field: &str| -> Result<usize, ConfigError> {
                    let name = node[field]
                        .as_str()
                        .ok_or_else(|| ConfigError::MissingField("collisions".into(), field.into()))?;
                    species
                        .iter()
                        .position(|s| s.name == name)
                        .ok_or_else(|| ConfigError::Invalid(format!("unknown species '{}'", name)))
                };
                collisions.push(CollisionParams {
                    species_a: pair_name("species_a")?,
                    species_b: pair_name("species_b")?,
                    coulomb_log: eval_or(&node["coulomb_log"], &constants, 2.0),
                    every: match &node["every"] {
                        yaml_rust::yaml::Yaml::Integer(i) if *i > 0 => TimeSelection::Every(*i as usize),
                        _ => TimeSelection::Every(1),
                    },
                });
            }
        }

        let mut antennas = Vec::new();
        if let yaml_rust::yaml::Yaml::Array(list) = cfg.section("antennas") {
            for node in list {
                let component = match node["field"].as_str() {
                    Some("Jx") => 0,
                    Some("Jy") => 1,
                    Some("Jz") => 2,
                    other => {
                        return Err(ConfigError::Invalid(format!(
                            "antenna field must be Jx/Jy/Jz, got {:?}",
                            other
                        )))
                    }
                };
                let profile = Profile::from_node(&node["profile"], &constants)
                    .ok_or_else(|| ConfigError::MissingField("antennas".into(), "profile".into()))?;
                antennas.push(Antenna { component, profile });
            }
        }

        let mut external_fields = Vec::new();
        if let yaml_rust::yaml::Yaml::Array(list) = cfg.section("external_fields") {
            for node in list {
                let (electric, component) = match node["field"].as_str() {
                    Some("Ex") => (true, 0),
                    Some("Ey") => (true, 1),
                    Some("Ez") => (true, 2),
                    Some("Bx") => (false, 0),
                    Some("By") => (false, 1),
                    Some("Bz") => (false, 2),
                    other => {
                        return Err(ConfigError::Invalid(format!(
                            "external field must be one of Ex..Bz, got {:?}",
                            other
                        )))
                    }
                };
                let profile = Profile::from_node(&node["profile"], &constants).ok_or_else(|| {
                    ConfigError::MissingField("external_fields".into(), "profile".into())
                })?;
                external_fields.push(ExternalField { electric, component, profile });
            }
        }

        let mut binning = Vec::new();
        if let yaml_rust::yaml::Yaml::Array(list) = cfg.section("binning") {
            for node in list {
                let name = node["species"]
                    .as_str()
                    .ok_or_else(|| ConfigError::MissingField("binning".into(), "species".into()))?;
                let sp = species
                    .iter()
                    .position(|s| s.name == name)
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown species '{}'", name)))?;
                let spec = node["quantities"]
                    .as_str()
                    .ok_or_else(|| ConfigError::MissingField("binning".into(), "quantities".into()))?
                    .to_owned();
                let every = match &node["every"] {
                    yaml_rust::yaml::Yaml::Integer(i) if *i > 0 => TimeSelection::Every(*i as usize),
                    _ => TimeSelection::Never,
                };
                binning.push(BinningSpec { species: sp, spec, every });
            }
        }
        let diags = DiagParams {
            scalars_every: cfg.time_selection("diags", "scalars_every")?,
            fields_every: cfg.time_selection("diags", "fields_every")?,
            binning,
            directory: cfg.string("diags", "directory").unwrap_or_else(|_| ".".to_owned()),
        };

        Ok(Params {
            geometry,
            ndim_field,
            ndim_particle,
            cell_length,
            n_global,
            n_per_patch,
            n_patches_grid,
            total_patches,
            ghost: 3,
            timestep,
            n_time,
            time_fields_frozen: cfg.real_or("control", "time_fields_frozen", 0.0)?,
            em_bcs,
            laser,
            solve_poisson: cfg.bool_or("control", "solve_poisson", false)?,
            poisson_tolerance: cfg.real_or("control", "poisson_tolerance", 1.0e-14)?,
            poisson_max_iteration: cfg.integer_or("control", "poisson_max_iteration", 50_000)? as usize,
            print_every: cfg.integer_or("control", "print_every", 100)? as usize,
            random_seed: cfg.integer_or("control", "random_seed", 0)? as u64,
            reference_frequency,
            species,
            photon_species,
            window,
            load_balancing,
            global_factor,
            checkpoint,
            collisions,
            antennas,
            external_fields,
            diags,
        })
    }

    /// Physical extent of one patch along an axis.
    pub fn patch_length(&self, d: usize) -> f64 {
        self.n_per_patch[d] as f64 * self.cell_length[d]
    }

    pub fn cell_volume(&self) -> f64 {
        (0..self.ndim_field).map(|d| self.cell_length[d]).product()
    }

    pub fn is_periodic(&self, d: usize) -> bool {
        self.em_bcs[d][0] == EmBoundary::Periodic
    }
}

fn fixed3(v: &[f64], ndim: usize, name: &str, fill: f64) -> Result<[f64; 3], ConfigError> {
    if v.len() != ndim {
        return Err(ConfigError::Invalid(format!(
            "'{}' needs {} entries, got {}",
            name,
            ndim,
            v.len()
        )));
    }
    let mut out = [fill; 3];
    out[..ndim].copy_from_slice(v);
    Ok(out)
}

fn fixed3u(v: &[usize], ndim: usize, name: &str, fill: usize) -> Result<[usize; 3], ConfigError> {
    if v.len() != ndim {
        return Err(ConfigError::Invalid(format!(
            "'{}' needs {} entries, got {}",
            name,
            ndim,
            v.len()
        )));
    }
    let mut out = [fill; 3];
    out[..ndim].copy_from_slice(v);
    Ok(out)
}

fn eval_or(node: &yaml_rust::yaml::Yaml, constants: &std::sync::Arc<Vec<(String, f64)>>, default: f64) -> f64 {
    Profile::from_node(node, constants)
        .map(|p| p.at([0.0; 3]))
        .unwrap_or(default)
}

fn read_species(
    node: &yaml_rust::yaml::Yaml,
    constants: &std::sync::Arc<Vec<(String, f64)>>,
    ndim_field: usize,
    geometry: GeometryKind,
    em_bcs: &[[EmBoundary; 2]; 3],
) -> Result<(SpeciesSpec, Option<String>), ConfigError> {
    let name = node["name"]
        .as_str()
        .ok_or_else(|| ConfigError::MissingField("species".into(), "name".into()))?
        .to_owned();
    let mass = eval_or(&node["mass"], constants, f64::NAN);
    if !mass.is_finite() || mass < 0.0 {
        return Err(ConfigError::Invalid(format!("species '{}' has invalid mass", name)));
    }
    let charge = eval_or(&node["charge"], constants, f64::NAN);
    if !charge.is_finite() {
        return Err(ConfigError::Invalid(format!("species '{}' has invalid charge", name)));
    }
    if mass == 0.0 && charge != 0.0 {
        return Err(ConfigError::Invalid(format!(
            "photon species '{}' must carry zero charge",
            name
        )));
    }

    let density = Profile::from_node(&node["density"], constants)
        .unwrap_or_else(|| Profile::constant(0.0));
    let momentum = [
        Profile::from_node(&node["mean_ux"], constants).unwrap_or_else(|| Profile::constant(0.0)),
        Profile::from_node(&node["mean_uy"], constants).unwrap_or_else(|| Profile::constant(0.0)),
        Profile::from_node(&node["mean_uz"], constants).unwrap_or_else(|| Profile::constant(0.0)),
    ];

    let tracked = node["tracked"].as_bool().unwrap_or(false);
    let radiating = node["radiating"].as_bool().unwrap_or(false);

    let mut bcs = [[ParticlePolicy::Periodic; 2]; 3];
    if let yaml_rust::yaml::Yaml::Array(axes) = &node["boundary_conditions"] {
        for (d, sides) in axes.iter().enumerate().take(ndim_field) {
            if let yaml_rust::yaml::Yaml::Array(pair) = sides {
                for (s, side) in pair.iter().enumerate().take(2) {
                    bcs[d][s] = match side.as_str() {
                        Some("reflective") => ParticlePolicy::Reflective,
                        Some("remove") => ParticlePolicy::Remove,
                        Some("stop") => ParticlePolicy::Stop,
                        Some("thermalize") => ParticlePolicy::Thermalize,
                        Some("periodic") => ParticlePolicy::Periodic,
                        Some("none") => ParticlePolicy::None,
                        other => {
                            return Err(ConfigError::Invalid(format!(
                                "species '{}': unknown boundary policy {:?}",
                                name, other
                            )))
                        }
                    };
                }
            }
        }
    }

    // Periodic EM boundaries force periodic particle boundaries for any
    // species that is not tracked.
    if !tracked {
        for d in 0..ndim_field {
            for s in 0..2 {
                if em_bcs[d][s] == EmBoundary::Periodic && bcs[d][s] != ParticlePolicy::Periodic {
                    return Err(ConfigError::Invalid(format!(
                        "species '{}': periodic EM {}-boundary requires a periodic particle boundary",
                        name,
                        ["x", "y", "z"][d]
                    )));
                }
            }
        }
    }
    // The converse holds for everyone: the exchange wraps positions only
    // where the field topology wraps, so a periodic particle boundary on
    // a non-periodic EM axis would strand particles.
    for d in 0..ndim_field {
        for s in 0..2 {
            if bcs[d][s] == ParticlePolicy::Periodic && em_bcs[d][s] != EmBoundary::Periodic {
                return Err(ConfigError::Invalid(format!(
                    "species '{}': periodic particle boundary on a non-periodic EM {}-boundary",
                    name,
                    ["x", "y", "z"][d]
                )));
            }
        }
    }

    // Axisymmetric radial axis: only removal is admissible at the outer
    // face; the inner face (r = 0) takes no policy at all.
    if geometry == GeometryKind::AxiSym {
        if bcs[1][1] != ParticlePolicy::Remove {
            return Err(ConfigError::Invalid(format!(
                "species '{}': the outer radial boundary only supports 'remove'",
                name
            )));
        }
        bcs[1][0] = ParticlePolicy::None;
    }

    let pusher = match node["pusher"].as_str() {
        None | Some("boris") => PusherKind::Boris,
        Some("vay") => PusherKind::Vay,
        Some(other) => {
            return Err(ConfigError::Invalid(format!(
                "species '{}': unknown pusher '{}'",
                name, other
            )))
        }
    };

    // Tunnel ionization: atomic number plus the electron species the
    // freed charges land in. The species charge is the initial state.
    let mut atomic_number = 0usize;
    let mut electron_name = None;
    match node["ionization_model"].as_str() {
        None => {}
        Some("tunnel") => {
            atomic_number = match node["atomic_number"].as_i64() {
                Some(z) if z >= 1 => z as usize,
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "species '{}': tunnel ionization needs atomic_number >= 1",
                        name
                    )))
                }
            };
            electron_name = Some(
                node["ionization_electrons"]
                    .as_str()
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "species '{}': tunnel ionization needs ionization_electrons",
                            name
                        ))
                    })?
                    .to_owned(),
            );
            if charge < 0.0 || charge > atomic_number as f64 || charge.fract() != 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "species '{}': initial charge state {} must be an integer in [0, {}]",
                    name, charge, atomic_number
                )));
            }
        }
        Some(other) => {
            return Err(ConfigError::Invalid(format!(
                "species '{}': unknown ionization model '{}'",
                name, other
            )))
        }
    }

    let spec = SpeciesSpec {
        name,
        mass,
        charge,
        n_part_per_cell: node["n_part_per_cell"].as_i64().unwrap_or(0).max(0) as usize,
        density,
        momentum,
        bcs,
        thermal_momentum: eval_or(&node["thermal_momentum"], constants, 0.0),
        pusher,
        tracked,
        radiating,
        time_frozen: eval_or(&node["time_frozen"], constants, 0.0),
        atomic_number,
        ionization_electrons: None,
    };
    Ok((spec, electron_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Configuration;

    pub fn minimal_deck() -> String {
        "control:\n\
         \x20 geometry: 1d3v\n\
         \x20 cell_length: [0.1]\n\
         \x20 n_space_global: [64]\n\
         \x20 n_space_per_patch: [8]\n\
         \x20 timestep: 0.095\n\
         \x20 n_time: 10\n\
         em:\n\
         \x20 boundary_conditions: [[periodic, periodic]]\n\
         species:\n\
         \x20 - name: electrons\n\
         \x20   mass: 1.0\n\
         \x20   charge: -1.0\n\
         \x20   n_part_per_cell: 4\n\
         \x20   density: 1.0\n\
         \x20   boundary_conditions: [[periodic, periodic]]\n"
            .to_owned()
    }

    #[test]
    fn reads_a_minimal_deck() {
        let cfg = Configuration::from_str(&minimal_deck()).unwrap();
        let p = Params::read(&cfg).unwrap();
        assert_eq!(p.ndim_field, 1);
        assert_eq!(p.n_patches_grid[0], 8);
        assert_eq!(p.total_patches, 8);
        assert_eq!(p.species.len(), 1);
        assert_eq!(p.species[0].charge, -1.0);
    }

    #[test]
    fn rejects_nonconforming_patch_size() {
        let deck = minimal_deck().replace("n_space_per_patch: [8]", "n_space_per_patch: [7]");
        let cfg = Configuration::from_str(&deck).unwrap();
        assert!(Params::read(&cfg).is_err());
    }

    #[test]
    fn rejects_periodic_mismatch() {
        // Change only the species boundary line (deeper indent), leaving
        // the EM boundaries periodic.
        let deck = minimal_deck().replace(
            "   boundary_conditions: [[periodic, periodic]]",
            "   boundary_conditions: [[remove, remove]]",
        );
        let cfg = Configuration::from_str(&deck).unwrap();
        assert!(Params::read(&cfg).is_err());
    }

    #[test]
    fn rejects_bad_radial_policy() {
        let deck = "control:\n\
             \x20 geometry: 3drz\n\
             \x20 cell_length: [0.1, 0.1]\n\
             \x20 n_space_global: [32, 16]\n\
             \x20 n_space_per_patch: [8, 8]\n\
             \x20 timestep: 0.05\n\
             \x20 n_time: 10\n\
             em:\n\
             \x20 boundary_conditions: [[absorbing, absorbing], [reflective, absorbing]]\n\
             species:\n\
             \x20 - name: electrons\n\
             \x20   mass: 1.0\n\
             \x20   charge: -1.0\n\
             \x20   boundary_conditions: [[remove, remove], [none, reflective]]\n";
        let cfg = Configuration::from_str(deck).unwrap();
        let err = Params::read(&cfg).unwrap_err();
        assert!(err.to_string().contains("radial"));
    }

    #[test]
    fn rejects_overcritical_timestep() {
        let deck = minimal_deck().replace("timestep: 0.095", "timestep: 0.2");
        let cfg = Configuration::from_str(&deck).unwrap();
        assert!(Params::read(&cfg).is_err());
    }

    fn ionizable_deck(electron_target: &str, reference: &str) -> String {
        format!(
            "control:\n\
             \x20 geometry: 1d3v\n\
             \x20 cell_length: [0.1]\n\
             \x20 n_space_global: [16]\n\
             \x20 timestep: 0.05\n\
             \x20 n_time: 1\n\
             {}\
             em:\n\
             \x20 boundary_conditions: [[periodic, periodic]]\n\
             species:\n\
             \x20 - name: carbon\n\
             \x20   mass: 22032.0\n\
             \x20   charge: 0.0\n\
             \x20   density: 0.1\n\
             \x20   ionization_model: tunnel\n\
             \x20   atomic_number: 6\n\
             \x20   ionization_electrons: {}\n\
             \x20   boundary_conditions: [[periodic, periodic]]\n\
             \x20 - name: electrons\n\
             \x20   mass: 1.0\n\
             \x20   charge: -1.0\n\
             \x20   density: 0.0\n\
             \x20   boundary_conditions: [[periodic, periodic]]\n",
            reference, electron_target
        )
    }

    #[test]
    fn resolves_ionization_target() {
        let deck = ionizable_deck("electrons", "\x20 reference_frequency: 1.885e15\n");
        let cfg = Configuration::from_str(&deck).unwrap();
        let p = Params::read(&cfg).unwrap();
        assert!(p.species[0].ionizable());
        assert_eq!(p.species[0].atomic_number, 6);
        assert_eq!(p.species[0].ionization_electrons, Some(1));
    }

    #[test]
    fn rejects_unknown_ionization_target() {
        let deck = ionizable_deck("positrons", "\x20 reference_frequency: 1.885e15\n");
        let cfg = Configuration::from_str(&deck).unwrap();
        assert!(Params::read(&cfg).is_err());
    }

    #[test]
    fn ionization_requires_a_reference_frequency() {
        let deck = ionizable_deck("electrons", "");
        let cfg = Configuration::from_str(&deck).unwrap();
        let err = Params::read(&cfg).unwrap_err();
        assert!(err.to_string().contains("reference_frequency"));
    }

    #[test]
    fn rejects_out_of_range_initial_charge_state() {
        let deck = ionizable_deck("electrons", "\x20 reference_frequency: 1.885e15\n")
            .replace("charge: 0.0", "charge: 7.0");
        let cfg = Configuration::from_str(&deck).unwrap();
        assert!(Params::read(&cfg).is_err());
    }
}
