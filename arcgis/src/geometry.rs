//! Construction des géométries à partir des charges utiles du service
//!
//! Chaîne de traitement : charge utile → `geo::Geometry`, transformation de
//! coordonnées optionnelle, coercition vers le type de la colonne, contrôle de
//! validité.

use geo::{
    Coord, CoordsIter, Geometry, LineString, MapCoords, MultiLineString, MultiPoint,
    MultiPolygon, Point, Polygon, Rect, Winding,
};
use serde_json::Value;

use crate::error::GeometryError;
use crate::mapping::DestinationGeometryKind;
use crate::types::GeometryPayload;

/// Transformation de coordonnées (reprojection côté client)
pub trait CoordTransform: Send + Sync {
    fn transform(&self, coord: Coord) -> Result<Coord, GeometryError>;
}

/// Traduit une charge utile en géométrie prête pour la colonne destination
pub fn translate(
    payload: Option<&GeometryPayload>,
    expected: DestinationGeometryKind,
    transform: Option<&dyn CoordTransform>,
) -> Result<Geometry, GeometryError> {
    let payload = payload.ok_or(GeometryError::Missing)?;
    let geometry = build(payload)?;

    if geometry.coords_count() == 0 {
        return Err(GeometryError::Empty);
    }

    let geometry = match transform {
        Some(t) => geometry.try_map_coords(|c| t.transform(c))?,
        None => geometry,
    };

    let geometry = coerce(geometry, expected)?;
    validate(&geometry)?;
    Ok(geometry)
}

/// Construit la géométrie brute, sans coercition
pub fn build(payload: &GeometryPayload) -> Result<Geometry, GeometryError> {
    match payload {
        GeometryPayload::Rings { rings } => build_polygons(rings),
        GeometryPayload::Paths { paths } => {
            let mut lines = paths
                .iter()
                .map(|p| line(p))
                .collect::<Result<Vec<_>, _>>()?;
            match lines.len() {
                0 => Err(GeometryError::Empty),
                1 => Ok(Geometry::LineString(lines.remove(0))),
                _ => Ok(Geometry::MultiLineString(MultiLineString::new(lines))),
            }
        }
        GeometryPayload::Points { points } => {
            let points = points
                .iter()
                .map(|p| position(p).map(Point::from))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Geometry::MultiPoint(MultiPoint::new(points)))
        }
        GeometryPayload::Envelope {
            xmin,
            ymin,
            xmax,
            ymax,
        } => {
            let rect = Rect::new(
                Coord { x: *xmin, y: *ymin },
                Coord { x: *xmax, y: *ymax },
            );
            Ok(Geometry::Polygon(rect.to_polygon()))
        }
        GeometryPayload::Point { x, y } => Ok(Geometry::Point(Point::new(*x, *y))),
        GeometryPayload::GeoJson(geometry) => Geometry::<f64>::try_from(geometry.value.clone())
            .map_err(|e| GeometryError::Unsupported(e.to_string())),
        GeometryPayload::Other(value) => Err(classify_unknown(value)),
    }
}

fn classify_unknown(value: &Value) -> GeometryError {
    let Some(object) = value.as_object() else {
        return GeometryError::Unsupported(value.to_string());
    };

    // Point vide : {"x": null} ou {"x": "NaN"}
    if object.get("x").is_some_and(|x| !x.is_number()) {
        return GeometryError::Empty;
    }
    if object.contains_key("curveRings") || object.contains_key("curvePaths") {
        return GeometryError::Unsupported("curve geometry".to_string());
    }

    let keys: Vec<&str> = object.keys().map(String::as_str).collect();
    GeometryError::Unsupported(format!("unknown payload keys {:?}", keys))
}

fn position(values: &[f64]) -> Result<Coord, GeometryError> {
    match values {
        [x, y, ..] => Ok(Coord { x: *x, y: *y }),
        _ => Err(GeometryError::InvalidPosition(format!("{:?}", values))),
    }
}

fn line(path: &[Vec<f64>]) -> Result<LineString, GeometryError> {
    path.iter()
        .map(|p| position(p))
        .collect::<Result<Vec<_>, _>>()
        .map(LineString::new)
}

/// Regroupe les anneaux en polygones
///
/// Les anneaux extérieurs tournent dans le sens horaire, les trous dans le
/// sens inverse. Un trou est rattaché au dernier extérieur rencontré ; le
/// premier anneau ouvre toujours un polygone.
fn build_polygons(rings: &[Vec<Vec<f64>>]) -> Result<Geometry, GeometryError> {
    let mut polygons: Vec<(LineString, Vec<LineString>)> = Vec::new();

    for ring in rings {
        let mut ring = line(ring)?;
        if ring.0.is_empty() {
            continue;
        }
        ring.close();

        match polygons.last_mut() {
            Some((_, holes)) if !ring.is_cw() => holes.push(ring),
            _ => polygons.push((ring, Vec::new())),
        }
    }

    let mut polygons: Vec<Polygon> = polygons
        .into_iter()
        .map(|(exterior, holes)| Polygon::new(exterior, holes))
        .collect();

    match polygons.len() {
        0 => Err(GeometryError::Empty),
        1 => Ok(Geometry::Polygon(polygons.remove(0))),
        _ => Ok(Geometry::MultiPolygon(MultiPolygon::new(polygons))),
    }
}

/// Nom du type d'une géométrie, pour les messages d'erreur
pub fn kind_name(geometry: &Geometry) -> &'static str {
    match geometry {
        Geometry::Point(_) => "POINT",
        Geometry::Line(_) => "LINE",
        Geometry::LineString(_) => "LINESTRING",
        Geometry::Polygon(_) => "POLYGON",
        Geometry::MultiPoint(_) => "MULTIPOINT",
        Geometry::MultiLineString(_) => "MULTILINESTRING",
        Geometry::MultiPolygon(_) => "MULTIPOLYGON",
        Geometry::GeometryCollection(_) => "GEOMETRYCOLLECTION",
        Geometry::Rect(_) => "RECT",
        Geometry::Triangle(_) => "TRIANGLE",
    }
}

/// Convertit la géométrie vers le type de la colonne destination
pub fn coerce(
    geometry: Geometry,
    expected: DestinationGeometryKind,
) -> Result<Geometry, GeometryError> {
    use DestinationGeometryKind as K;

    let incompatible = |g: &Geometry| GeometryError::Incompatible {
        found: kind_name(g).to_string(),
        expected: expected.to_string(),
    };

    let coerced = match (expected, geometry) {
        (K::Point, g @ Geometry::Point(_)) => g,
        (K::Point, Geometry::MultiPoint(mut mp)) if mp.0.len() == 1 => {
            Geometry::Point(mp.0.remove(0))
        }

        (K::MultiPoint, Geometry::Point(p)) => Geometry::MultiPoint(MultiPoint::new(vec![p])),
        (K::MultiPoint, g @ Geometry::MultiPoint(_)) => g,

        (K::LineString, g @ Geometry::LineString(_)) => g,
        (K::LineString, Geometry::Line(l)) => Geometry::LineString(l.into()),
        (K::LineString, Geometry::MultiLineString(mls)) => match join_paths(&mls) {
            Some(joined) => Geometry::LineString(joined),
            None => return Err(incompatible(&Geometry::MultiLineString(mls))),
        },

        (K::MultiLineString, Geometry::LineString(ls)) => {
            Geometry::MultiLineString(MultiLineString::new(vec![ls]))
        }
        (K::MultiLineString, g @ Geometry::MultiLineString(_)) => g,

        (K::Polygon, g @ Geometry::Polygon(_)) => g,
        (K::Polygon, Geometry::Rect(r)) => Geometry::Polygon(r.to_polygon()),
        (K::Polygon, Geometry::MultiPolygon(mut mp)) if mp.0.len() == 1 => {
            Geometry::Polygon(mp.0.remove(0))
        }

        (K::MultiPolygon, Geometry::Polygon(p)) => {
            Geometry::MultiPolygon(MultiPolygon::new(vec![p]))
        }
        (K::MultiPolygon, Geometry::Rect(r)) => {
            Geometry::MultiPolygon(MultiPolygon::new(vec![r.to_polygon()]))
        }
        (K::MultiPolygon, g @ Geometry::MultiPolygon(_)) => g,

        // Pas de représentation des courbes dans `geo`
        (_, g) => return Err(incompatible(&g)),
    };

    Ok(coerced)
}

/// Fusionne des chemins bout à bout ; `None` si un chemin ne prolonge pas le
/// précédent
fn join_paths(mls: &MultiLineString) -> Option<LineString> {
    let mut paths = mls.0.iter();
    let mut joined: Vec<Coord> = paths.next()?.0.clone();

    for path in paths {
        let (Some(last), Some(first)) = (joined.last(), path.0.first()) else {
            return None;
        };
        if !coords_equal(*last, *first) {
            return None;
        }
        joined.extend(path.0.iter().skip(1));
    }

    Some(LineString::new(joined))
}

/// Compare deux coordonnées avec tolérance
fn coords_equal(a: Coord, b: Coord) -> bool {
    const TOLERANCE: f64 = 1e-9;
    (a.x - b.x).abs() < TOLERANCE && (a.y - b.y).abs() < TOLERANCE
}

/// Contrôle de validité avant écriture dans PostGIS
pub fn validate(geometry: &Geometry) -> Result<(), GeometryError> {
    if geometry.coords_count() == 0 {
        return Err(GeometryError::Empty);
    }
    if geometry
        .coords_iter()
        .any(|c| !c.x.is_finite() || !c.y.is_finite())
    {
        return Err(GeometryError::Invalid("non-finite coordinate".to_string()));
    }
    if !structure_ok(geometry) {
        return Err(GeometryError::Invalid(format!(
            "degenerate {}",
            kind_name(geometry)
        )));
    }
    Ok(())
}

fn structure_ok(geometry: &Geometry) -> bool {
    fn ring_ok(r: &LineString) -> bool {
        // Anneau : au moins 4 points, fermé
        r.0.len() >= 4 && r.is_closed()
    }

    fn polygon_ok(p: &Polygon) -> bool {
        ring_ok(p.exterior()) && p.interiors().iter().all(ring_ok)
    }

    match geometry {
        Geometry::LineString(ls) => ls.0.len() >= 2,
        Geometry::MultiLineString(mls) => {
            !mls.0.is_empty() && mls.0.iter().all(|ls| ls.0.len() >= 2)
        }
        Geometry::Polygon(p) => polygon_ok(p),
        Geometry::MultiPolygon(mp) => !mp.0.is_empty() && mp.0.iter().all(polygon_ok),
        Geometry::MultiPoint(mp) => !mp.0.is_empty(),
        Geometry::GeometryCollection(gc) => gc.0.iter().all(structure_ok),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> GeometryPayload {
        serde_json::from_value(value).unwrap()
    }

    struct Shift;

    impl CoordTransform for Shift {
        fn transform(&self, coord: Coord) -> Result<Coord, GeometryError> {
            Ok(Coord {
                x: coord.x + 10.0,
                y: coord.y,
            })
        }
    }

    struct Failing;

    impl CoordTransform for Failing {
        fn transform(&self, _coord: Coord) -> Result<Coord, GeometryError> {
            Err(GeometryError::Transform("no grid".to_string()))
        }
    }

    #[test]
    fn test_missing_payload() {
        let result = translate(None, DestinationGeometryKind::Point, None);
        assert_eq!(result, Err(GeometryError::Missing));
    }

    #[test]
    fn test_single_ring_to_multipolygon() {
        // Anneau horaire (extérieur ArcGIS)
        let p = payload(json!({"rings": [[[0, 0], [0, 1], [1, 1], [1, 0], [0, 0]]]}));
        assert!(matches!(build(&p).unwrap(), Geometry::Polygon(_)));

        let g = translate(Some(&p), DestinationGeometryKind::MultiPolygon, None).unwrap();
        match g {
            Geometry::MultiPolygon(mp) => {
                assert_eq!(mp.0.len(), 1);
                assert_eq!(mp.0[0].exterior().0.len(), 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rings_with_hole_and_second_exterior() {
        let p = payload(json!({"rings": [
            [[0, 0], [0, 10], [10, 10], [10, 0], [0, 0]],
            [[2, 2], [4, 2], [4, 4], [2, 4], [2, 2]],
            [[20, 0], [20, 5], [25, 5], [25, 0], [20, 0]]
        ]}));

        match build(&p).unwrap() {
            Geometry::MultiPolygon(mp) => {
                assert_eq!(mp.0.len(), 2);
                assert_eq!(mp.0[0].interiors().len(), 1);
                assert!(mp.0[1].interiors().is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unclosed_ring_is_closed() {
        let p = payload(json!({"rings": [[[0, 0], [0, 1], [1, 1], [1, 0]]]}));
        let g = translate(Some(&p), DestinationGeometryKind::Polygon, None).unwrap();
        match g {
            Geometry::Polygon(poly) => assert!(poly.exterior().is_closed()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_paths() {
        let single = payload(json!({"paths": [[[0, 0], [1, 1]]]}));
        assert!(matches!(build(&single).unwrap(), Geometry::LineString(_)));

        let multiple = payload(json!({"paths": [[[0, 0], [1, 1]], [[5, 5], [6, 6]]]}));
        assert!(matches!(
            build(&multiple).unwrap(),
            Geometry::MultiLineString(_)
        ));

        // Chemins disjoints : pas de LineString possible
        let result = translate(Some(&multiple), DestinationGeometryKind::LineString, None);
        assert!(matches!(result, Err(GeometryError::Incompatible { .. })));

        let contiguous = payload(json!({"paths": [[[0, 0], [1, 1]], [[1, 1], [2, 0]]]}));
        match translate(Some(&contiguous), DestinationGeometryKind::LineString, None).unwrap() {
            Geometry::LineString(ls) => assert_eq!(ls.0.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_points() {
        let p = payload(json!({"x": 2.35, "y": 48.85}));
        let g = translate(Some(&p), DestinationGeometryKind::MultiPoint, None).unwrap();
        assert!(matches!(g, Geometry::MultiPoint(ref mp) if mp.0.len() == 1));

        let mp = payload(json!({"points": [[1, 2]]}));
        let g = translate(Some(&mp), DestinationGeometryKind::Point, None).unwrap();
        assert_eq!(g, Geometry::Point(Point::new(1.0, 2.0)));

        let two = payload(json!({"points": [[1, 2], [3, 4]]}));
        assert!(translate(Some(&two), DestinationGeometryKind::Point, None).is_err());
    }

    #[test]
    fn test_envelope() {
        let p = payload(json!({"xmin": 0, "ymin": 0, "xmax": 2, "ymax": 1}));
        let g = translate(Some(&p), DestinationGeometryKind::Polygon, None).unwrap();
        assert!(matches!(g, Geometry::Polygon(_)));
    }

    #[test]
    fn test_geojson_payload() {
        let p = payload(json!({
            "type": "Polygon",
            "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]]
        }));
        let g = translate(Some(&p), DestinationGeometryKind::MultiPolygon, None).unwrap();
        assert!(matches!(g, Geometry::MultiPolygon(_)));
    }

    #[test]
    fn test_empty_and_curves() {
        let empty_point = payload(json!({"x": null, "y": null}));
        assert_eq!(
            translate(Some(&empty_point), DestinationGeometryKind::Point, None),
            Err(GeometryError::Empty)
        );

        let empty_rings = payload(json!({"rings": []}));
        assert_eq!(
            translate(Some(&empty_rings), DestinationGeometryKind::Polygon, None),
            Err(GeometryError::Empty)
        );

        let curve = payload(json!({"curveRings": [[[0, 0], {"c": [[1, 1], [0.5, 0.5]]}]]}));
        assert!(matches!(
            translate(Some(&curve), DestinationGeometryKind::Polygon, None),
            Err(GeometryError::Unsupported(_))
        ));

        let line = payload(json!({"paths": [[[0, 0], [1, 1]]]}));
        assert!(matches!(
            translate(Some(&line), DestinationGeometryKind::Curve, None),
            Err(GeometryError::Incompatible { .. })
        ));
    }

    #[test]
    fn test_incompatible_kinds() {
        let p = payload(json!({"x": 1, "y": 2}));
        assert_eq!(
            translate(Some(&p), DestinationGeometryKind::MultiPolygon, None),
            Err(GeometryError::Incompatible {
                found: "POINT".to_string(),
                expected: "MULTIPOLYGON".to_string()
            })
        );
    }

    #[test]
    fn test_invalid_geometries() {
        let short_line = payload(json!({"paths": [[[0, 0]]]}));
        assert!(matches!(
            translate(Some(&short_line), DestinationGeometryKind::LineString, None),
            Err(GeometryError::Invalid(_))
        ));

        let flat_ring = payload(json!({"rings": [[[0, 0], [1, 1]]]}));
        assert!(matches!(
            translate(Some(&flat_ring), DestinationGeometryKind::Polygon, None),
            Err(GeometryError::Invalid(_))
        ));

        let short_position = payload(json!({"paths": [[[0], [1, 1]]]}));
        assert!(matches!(
            translate(Some(&short_position), DestinationGeometryKind::LineString, None),
            Err(GeometryError::InvalidPosition(_))
        ));
    }

    #[test]
    fn test_transform_applied_before_coercion() {
        let p = payload(json!({"x": 1, "y": 2}));
        let g = translate(Some(&p), DestinationGeometryKind::Point, Some(&Shift)).unwrap();
        assert_eq!(g, Geometry::Point(Point::new(11.0, 2.0)));

        assert_eq!(
            translate(Some(&p), DestinationGeometryKind::Point, Some(&Failing)),
            Err(GeometryError::Transform("no grid".to_string()))
        );
    }
}
