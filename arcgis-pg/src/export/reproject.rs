//! Reprojection des coordonnées côté client avec PROJ
//!
//! Utilisée quand le service ne sait pas reprojeter (`outSR`) ou quand la
//! configuration le demande. Disponible uniquement avec le feature
//! `reproject`.

use arcgis::SpatialReference;

use crate::error::StructuralError;

/// Vérifie si la reprojection est disponible
pub fn is_available() -> bool {
    cfg!(feature = "reproject")
}

/// Nom de CRS compris par PROJ
fn crs_definition(srs: &SpatialReference) -> String {
    match srs {
        SpatialReference::Epsg(code) => format!("EPSG:{}", code),
        SpatialReference::Wkt(wkt) => wkt.clone(),
    }
}

#[cfg(feature = "reproject")]
mod imp {
    use std::sync::Mutex;

    use arcgis::{CoordTransform, GeometryError, SpatialReference};
    use geo::Coord;
    use proj::Proj;
    use tracing::debug;

    use super::crs_definition;
    use crate::error::StructuralError;

    /// Reprojection de coordonnées entre deux systèmes
    pub struct Reprojector {
        proj: Mutex<Proj>,
        target_epsg: u32,
    }

    impl Reprojector {
        /// Crée un reprojector de `source` vers `EPSG:target_epsg`
        pub fn new(source: &SpatialReference, target_epsg: u32) -> Result<Self, StructuralError> {
            let from = crs_definition(source);
            let to = format!("EPSG:{}", target_epsg);

            let proj = Proj::new_known_crs(&from, &to, None).map_err(|e| {
                StructuralError::Reprojection(format!(
                    "Failed to create projection from {} to {}: {}",
                    from, to, e
                ))
            })?;

            debug!(source = ?source.epsg(), target = target_epsg, "Created reprojector");

            Ok(Self {
                proj: Mutex::new(proj),
                target_epsg,
            })
        }

        /// Retourne le SRID cible
        pub fn target_epsg(&self) -> u32 {
            self.target_epsg
        }
    }

    impl CoordTransform for Reprojector {
        fn transform(&self, coord: Coord) -> Result<Coord, GeometryError> {
            let proj = self
                .proj
                .lock()
                .map_err(|_| GeometryError::Transform("projection lock poisoned".to_string()))?;
            let (x, y) = proj
                .convert((coord.x, coord.y))
                .map_err(|e| GeometryError::Transform(e.to_string()))?;
            Ok(Coord { x, y })
        }
    }
}

#[cfg(not(feature = "reproject"))]
mod imp {
    use arcgis::{CoordTransform, GeometryError, SpatialReference};
    use geo::Coord;

    use crate::error::StructuralError;

    /// Reprojector factice : seule l'identité est possible sans le feature
    pub struct Reprojector {
        target_epsg: u32,
    }

    impl Reprojector {
        pub fn new(source: &SpatialReference, target_epsg: u32) -> Result<Self, StructuralError> {
            if source.epsg() == Some(target_epsg) {
                Ok(Self { target_epsg })
            } else {
                Err(StructuralError::Reprojection(format!(
                    "Reprojection from {} to EPSG:{} requires the 'reproject' feature. \
                     Build with: cargo build --features reproject",
                    super::crs_definition(source),
                    target_epsg
                )))
            }
        }

        pub fn target_epsg(&self) -> u32 {
            self.target_epsg
        }
    }

    impl CoordTransform for Reprojector {
        fn transform(&self, coord: Coord) -> Result<Coord, GeometryError> {
            Ok(coord)
        }
    }
}

pub use imp::Reprojector;

/// Reprojector nécessaire pour écrire dans `target_epsg`, `None` si la
/// source est déjà dans ce système
pub fn reprojector_for(
    source: &SpatialReference,
    target_epsg: u32,
) -> Result<Option<Reprojector>, StructuralError> {
    if source.epsg() == Some(target_epsg) {
        return Ok(None);
    }
    Reprojector::new(source, target_epsg).map(Some)
}
