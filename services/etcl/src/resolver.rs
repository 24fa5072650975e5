//! Hierarchy & Overlap Resolver
//!
//! Raw observations from different fuentes coexist (the strict identity
//! includes `fuente_tabla`). The canonical projection keeps exactly one row
//! per logical identity using the fixed source preference order, and tags
//! hours-not-worked rows with their additive `rol`.
//!
//! The store exposes the same rule as the `observaciones_canonicas` view.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::model::{Observation, Rol, Slice};

/// Rank used for fuentes absent from `preferred_sources`.
pub const UNRANKED: usize = 1_000_000;

/// Fixed source preference order.
#[derive(Debug, Clone, Default)]
pub struct Preference {
    ranks: HashMap<String, usize>,
}

impl Preference {
    pub fn new(codigos: &[String]) -> Self {
        let ranks = codigos
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self { ranks }
    }

    pub fn rank(&self, codigo: &str) -> usize {
        self.ranks.get(codigo).copied().unwrap_or(UNRANKED)
    }

    /// Sort key: rank first, then the code itself so unranked fuentes stay
    /// ordered deterministically.
    fn key<'a>(&self, codigo: &'a str) -> (usize, &'a str) {
        (self.rank(codigo), codigo)
    }

    pub fn prefers(&self, a: &str, b: &str) -> bool {
        self.key(a) < self.key(b)
    }
}

/// One row of the canonical projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRow {
    #[serde(flatten)]
    pub observation: Observation,
    pub rol: Option<Rol>,
    /// Other fuentes that carried the same logical identity
    pub descartadas: Vec<String>,
}

/// One row per logical identity, ordered by identity.
pub fn canonicalize(rows: &[Observation], preference: &Preference) -> Vec<CanonicalRow> {
    let mut winners: BTreeMap<String, CanonicalRow> = BTreeMap::new();

    for obs in rows {
        let clave = obs.clave_logica();
        match winners.get_mut(&clave) {
            None => {
                winners.insert(
                    clave,
                    CanonicalRow {
                        rol: obs.rol(),
                        observation: obs.clone(),
                        descartadas: Vec::new(),
                    },
                );
            }
            Some(current) => {
                if preference.prefers(&obs.fuente_tabla, &current.observation.fuente_tabla) {
                    let loser = std::mem::replace(&mut current.observation, obs.clone());
                    current.descartadas.push(loser.fuente_tabla);
                } else {
                    current.descartadas.push(obs.fuente_tabla.clone());
                }
                current.descartadas.sort();
            }
        }
    }

    winners.into_values().collect()
}

/// Group canonical rows by slice.
pub fn by_slice(rows: Vec<CanonicalRow>) -> BTreeMap<Slice, Vec<CanonicalRow>> {
    let mut grouped: BTreeMap<Slice, Vec<CanonicalRow>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.observation.slice()).or_default().push(row);
    }
    grouped
}
