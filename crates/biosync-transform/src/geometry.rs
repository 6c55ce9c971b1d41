//! Geometry collection normalization and validity repair.

use biosync_core::GeometryKind;
use geo::orient::{Direction, Orient};
use geo::{
    BooleanOps, Buffer, Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point,
    RemoveRepeatedPoints, Validation,
};

fn flatten_into(geometry: Geometry<f64>, out: &mut Vec<Geometry<f64>>) {
    match geometry {
        Geometry::GeometryCollection(collection) => {
            for member in collection.0 {
                flatten_into(member, out);
            }
        }
        other => out.push(other),
    }
}

fn polygon_or_multi(mut polygons: MultiPolygon<f64>) -> Option<Geometry<f64>> {
    match polygons.0.len() {
        0 => None,
        1 => polygons.0.pop().map(Geometry::Polygon),
        _ => Some(Geometry::MultiPolygon(polygons)),
    }
}

fn areal(member: Geometry<f64>, buffer_distance: f64) -> MultiPolygon<f64> {
    match member {
        Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
        Geometry::MultiPolygon(mp) => mp,
        Geometry::Rect(r) => MultiPolygon::new(vec![r.to_polygon()]),
        Geometry::Triangle(t) => MultiPolygon::new(vec![t.to_polygon()]),
        other => other.buffer(buffer_distance),
    }
}

/// Collapse a geometry collection into a single persistable geometry.
///
/// Non-collections are returned untouched with `converted == false`.
pub fn normalize_collection(geometry: Geometry<f64>, buffer_distance: f64) -> (Option<Geometry<f64>>, bool) {
    if !matches!(geometry, Geometry::GeometryCollection(_)) {
        return (Some(geometry), false);
    }
    let mut members = Vec::new();
    flatten_into(geometry, &mut members);

    if members.len() <= 1 {
        return (members.pop(), true);
    }

    let kinds = members.iter().filter_map(GeometryKind::of).collect::<Vec<_>>();
    let homogeneous = kinds.len() == members.len() && kinds.windows(2).all(|w| w[0] == w[1]);
    if homogeneous {
        return (Some(into_multi(kinds[0], members)), true);
    }

    let union = members
        .into_iter()
        .map(|m| areal(m, buffer_distance))
        .reduce(|acc, next| acc.union(&next));
    (union.and_then(polygon_or_multi), true)
}

fn into_multi(kind: GeometryKind, members: Vec<Geometry<f64>>) -> Geometry<f64> {
    match kind {
        GeometryKind::Point => {
            let mut points = Vec::new();
            for member in members {
                match member {
                    Geometry::Point(p) => points.push(p),
                    Geometry::MultiPoint(mp) => points.extend(mp.0),
                    _ => {}
                }
            }
            Geometry::MultiPoint(MultiPoint::new(points))
        }
        GeometryKind::Line => {
            let mut lines = Vec::new();
            for member in members {
                match member {
                    Geometry::Line(l) => lines.push(LineString::new(vec![l.start, l.end])),
                    Geometry::LineString(ls) => lines.push(ls),
                    Geometry::MultiLineString(mls) => lines.extend(mls.0),
                    _ => {}
                }
            }
            Geometry::MultiLineString(MultiLineString::new(lines))
        }
        GeometryKind::Polygon => {
            let polygons = members
                .into_iter()
                .flat_map(|m| areal(m, 0.0).0)
                .collect::<Vec<_>>();
            Geometry::MultiPolygon(MultiPolygon::new(polygons))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Repair {
    Valid(Geometry<f64>),
    Repaired(Geometry<f64>),
    Unrepairable,
}

fn finite(c: &Coord<f64>) -> bool {
    c.x.is_finite() && c.y.is_finite()
}

/// Lines with fewer than two distinct coordinates become points.
fn demote_line(line: LineString<f64>) -> Option<Geometry<f64>> {
    let line = line.remove_repeated_points();
    match line.0.len() {
        0 => None,
        1 => Some(Geometry::Point(Point::from(line.0[0]))),
        _ => Some(Geometry::LineString(line)),
    }
}

fn resolve_polygons(polygons: MultiPolygon<f64>) -> Option<Geometry<f64>> {
    let cleaned = polygons.remove_repeated_points().orient(Direction::Default);
    // unioning against nothing re-nodes self-intersecting rings
    polygon_or_multi(cleaned.union(&MultiPolygon::new(Vec::new())))
}

fn try_repair(geometry: Geometry<f64>) -> Option<Geometry<f64>> {
    match geometry {
        Geometry::Point(p) => finite(&p.0).then_some(Geometry::Point(p)),
        Geometry::MultiPoint(mp) => {
            let points = mp.0.into_iter().filter(|p| finite(&p.0)).collect::<Vec<_>>();
            match points.len() {
                0 => None,
                1 => Some(Geometry::Point(points[0])),
                _ => Some(Geometry::MultiPoint(MultiPoint::new(points))),
            }
        }
        Geometry::Line(l) => demote_line(LineString::new(vec![l.start, l.end])),
        Geometry::LineString(ls) => demote_line(ls),
        Geometry::MultiLineString(mls) => {
            let lines = mls
                .0
                .into_iter()
                .map(|line| line.remove_repeated_points())
                .filter(|l| l.0.len() >= 2)
                .collect::<Vec<_>>();
            match lines.len() {
                0 => None,
                1 => lines.into_iter().next().map(Geometry::LineString),
                _ => Some(Geometry::MultiLineString(MultiLineString::new(lines))),
            }
        }
        Geometry::Polygon(p) => resolve_polygons(MultiPolygon::new(vec![p])),
        Geometry::MultiPolygon(mp) => resolve_polygons(mp),
        Geometry::Rect(r) => resolve_polygons(MultiPolygon::new(vec![r.to_polygon()])),
        Geometry::Triangle(t) => resolve_polygons(MultiPolygon::new(vec![t.to_polygon()])),
        Geometry::GeometryCollection(_) => None,
    }
}

/// Valid geometries pass through; invalid ones are repaired or rejected.
pub fn repair(geometry: Geometry<f64>) -> Repair {
    if geometry.is_valid() {
        return Repair::Valid(geometry);
    }
    match try_repair(geometry) {
        Some(fixed) if fixed.is_valid() => Repair::Repaired(fixed),
        _ => Repair::Unrepairable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biosync_core::point;
    use geo::{line_string, Area, GeometryCollection, Polygon};

    fn polygon(exterior: Vec<(f64, f64)>) -> Polygon<f64> {
        Polygon::new(LineString::from(exterior), Vec::new())
    }

    fn collection(members: Vec<Geometry<f64>>) -> Geometry<f64> {
        Geometry::GeometryCollection(GeometryCollection::new_from(members))
    }

    #[test]
    fn plain_geometries_are_not_counted() {
        let (geometry, converted) = normalize_collection(point(1.0, 1.0), 10.0);
        assert!(!converted);
        assert_eq!(geometry, Some(point(1.0, 1.0)));
    }

    #[test]
    fn single_member_collection_unwraps() {
        let (geometry, converted) = normalize_collection(collection(vec![point(3.0, 4.0)]), 10.0);
        assert!(converted);
        assert_eq!(geometry, Some(point(3.0, 4.0)));
    }

    #[test]
    fn homogeneous_members_become_multi() {
        let nested = collection(vec![point(0.0, 0.0), collection(vec![point(1.0, 1.0), point(2.0, 2.0)])]);
        let (geometry, _) = normalize_collection(nested, 10.0);
        match geometry {
            Some(Geometry::MultiPoint(mp)) => assert_eq!(mp.0.len(), 3),
            other => panic!("expected multipoint, got {other:?}"),
        }
    }

    #[test]
    fn mixed_members_are_buffered_into_polygons() {
        let line = Geometry::LineString(line_string![(x: 100.0, y: 0.0), (x: 200.0, y: 0.0)]);
        let (geometry, converted) = normalize_collection(collection(vec![point(0.0, 0.0), line]), 5.0);
        assert!(converted);
        let geometry = geometry.expect("areal result");
        assert_eq!(GeometryKind::of(&geometry), Some(GeometryKind::Polygon));
        assert!(geometry.unsigned_area() > 0.0);
    }

    #[test]
    fn empty_collection_has_no_geometry() {
        assert_eq!(normalize_collection(collection(Vec::new()), 10.0), (None, true));
    }

    #[test]
    fn bowtie_is_repaired() {
        let bowtie = Geometry::Polygon(polygon(vec![(0.0, 0.0), (2.0, 2.0), (2.0, 0.0), (0.0, 2.0), (0.0, 0.0)]));
        assert!(!bowtie.is_valid());
        let outcome = repair(bowtie);
        assert!(matches!(outcome, Repair::Repaired(_)), "got {outcome:?}");
        let Repair::Repaired(Geometry::MultiPolygon(lobes)) = outcome else {
            panic!("expected a multipolygon, got {outcome:?}");
        };
        assert!(lobes.is_valid());
        assert_eq!(lobes.0.len(), 2);
        for lobe in &lobes.0 {
            assert!((lobe.unsigned_area() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn collapsed_polygon_is_unrepairable() {
        let sliver = Geometry::Polygon(polygon(vec![(0.0, 0.0), (1.0, 1.0), (0.0, 0.0)]));
        assert_eq!(repair(sliver), Repair::Unrepairable);
    }

    #[test]
    fn degenerate_line_is_demoted_to_point() {
        let line = Geometry::LineString(line_string![(x: 1.0, y: 1.0), (x: 1.0, y: 1.0)]);
        assert_eq!(repair(line), Repair::Repaired(point(1.0, 1.0)));
    }

    #[test]
    fn valid_and_unrepairable_inputs() {
        assert_eq!(repair(point(1.0, 2.0)), Repair::Valid(point(1.0, 2.0)));
        assert_eq!(repair(point(f64::NAN, 2.0)), Repair::Unrepairable);
    }
}
