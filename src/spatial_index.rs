//! A bulk-loaded spatial index over region geometries.

use geo::{BoundingRect, Contains, CoordsIter};
use geo_types::Geometry;
use rstar::{RTree, RTreeObject, AABB};

use crate::{CacheError, Result};

/// A single indexed region: a geometry, plus the value it resolves to
/// (typically a feature id).
#[derive(Clone, Debug)]
pub struct SpatialEntry<T> {
    /// The region's geometry.
    pub geom: Geometry<f64>,
    /// The value a containment hit resolves to.
    pub value: T,
}

impl<T> SpatialEntry<T> {
    pub fn new(geom: Geometry<f64>, value: T) -> SpatialEntry<T> {
        SpatialEntry { geom, value }
    }
}

/// What we actually store in the R-tree: the entry plus its precomputed
/// bounding rectangle, so tree queries never re-derive it.
#[derive(Debug)]
struct TreeEntry<T> {
    entry: SpatialEntry<T>,
    envelope: AABB<[f64; 2]>,
}

impl<T> RTreeObject for TreeEntry<T> {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// An immutable spatial index answering "which regions contain this
/// geometry".
///
/// The index is bulk-loaded (STR packing), so query performance does not
/// depend on the order entries arrived in. The tree only does the coarse
/// work: it narrows candidates by bounding rectangle, and every candidate
/// is then checked with the exact containment predicate.
#[derive(Debug)]
pub struct SpatialIndex<T> {
    tree: RTree<TreeEntry<T>>,
    num_coordinates: usize,
}

impl<T> SpatialIndex<T> {
    /// Build an index from `entries`. An empty sequence is legal and
    /// produces an index whose queries all come back empty.
    ///
    /// Fails if any entry's geometry has no bounding rectangle (an empty
    /// collection geometry, for example). Such an entry could never be
    /// found again, so we treat it as bad input rather than drop it.
    pub fn build(entries: Vec<SpatialEntry<T>>) -> Result<SpatialIndex<T>> {
        let mut num_coordinates = 0;
        let mut tree_entries = Vec::with_capacity(entries.len());
        for entry in entries {
            let rect = entry.geom.bounding_rect().ok_or_else(|| {
                CacheError::Geometry(
                    "entry geometry has no bounding rectangle".to_owned(),
                )
            })?;
            num_coordinates += entry.geom.coords_count();
            tree_entries.push(TreeEntry {
                envelope: AABB::from_corners(
                    [rect.min().x, rect.min().y],
                    [rect.max().x, rect.max().y],
                ),
                entry,
            });
        }
        Ok(SpatialIndex {
            tree: RTree::bulk_load(tree_entries),
            num_coordinates,
        })
    }

    /// Every indexed entry whose geometry contains `geom`, in no
    /// particular order.
    pub fn what_contains(&self, geom: &Geometry<f64>) -> Vec<&SpatialEntry<T>> {
        let Some(envelope) = query_envelope(geom) else {
            return Vec::new();
        };
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|node| &node.entry)
            .filter(|entry| entry.geom.contains(geom))
            .collect()
    }

    /// Any one entry whose geometry contains `geom`. Stops at the first
    /// candidate that passes the exact test.
    pub fn first_contains(&self, geom: &Geometry<f64>) -> Option<&SpatialEntry<T>> {
        let envelope = query_envelope(geom)?;
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|node| &node.entry)
            .find(|entry| entry.geom.contains(geom))
    }

    /// Total coordinate count across all indexed geometries. This is the
    /// cache's eviction size metric: the cost of a spatial entry scales
    /// with its coordinates, not with the number of features.
    pub fn num_coordinates(&self) -> usize {
        self.num_coordinates
    }

    /// How many entries the index holds.
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

/// The coarse query window for `geom`, or `None` if the geometry has no
/// extent (in which case nothing can contain it).
fn query_envelope(geom: &Geometry<f64>) -> Option<AABB<[f64; 2]>> {
    let rect = geom.bounding_rect()?;
    Some(AABB::from_corners(
        [rect.min().x, rect.min().y],
        [rect.max().x, rect.max().y],
    ))
}

#[cfg(test)]
mod tests {
    use geo_types::{point, polygon, MultiPolygon};

    use super::*;

    fn unit_square_at(x: f64, y: f64) -> Geometry<f64> {
        Geometry::Polygon(polygon![
            (x: x, y: y),
            (x: x + 1.0, y: y),
            (x: x + 1.0, y: y + 1.0),
            (x: x, y: y + 1.0),
            (x: x, y: y),
        ])
    }

    fn index_of_squares() -> SpatialIndex<i64> {
        SpatialIndex::build(vec![
            SpatialEntry::new(unit_square_at(0.0, 0.0), 1),
            SpatialEntry::new(unit_square_at(10.0, 10.0), 2),
            SpatialEntry::new(unit_square_at(0.5, 0.5), 3),
        ])
        .unwrap()
    }

    #[test]
    fn what_contains_matches_ground_truth() {
        let index = index_of_squares();
        let inside_first = Geometry::Point(point!(x: 0.25, y: 0.25));
        let mut values = index
            .what_contains(&inside_first)
            .into_iter()
            .map(|entry| entry.value)
            .collect::<Vec<_>>();
        values.sort_unstable();
        assert_eq!(values, vec![1]);

        // The point where square 1 and square 3 overlap.
        let overlap = Geometry::Point(point!(x: 0.75, y: 0.75));
        let mut values = index
            .what_contains(&overlap)
            .into_iter()
            .map(|entry| entry.value)
            .collect::<Vec<_>>();
        values.sort_unstable();
        assert_eq!(values, vec![1, 3]);

        let outside = Geometry::Point(point!(x: 5.0, y: 5.0));
        assert!(index.what_contains(&outside).is_empty());
    }

    #[test]
    fn first_contains_agrees_with_what_contains() {
        let index = index_of_squares();
        for (x, y) in [(0.25, 0.25), (0.75, 0.75), (5.0, 5.0), (10.5, 10.5)] {
            let geom = Geometry::Point(point!(x: x, y: y));
            assert_eq!(
                index.first_contains(&geom).is_some(),
                !index.what_contains(&geom).is_empty(),
            );
        }
    }

    #[test]
    fn envelope_candidates_are_filtered_exactly() {
        // A point inside square 1's bounding box but outside square 3's
        // geometry must not report square 3.
        let index = index_of_squares();
        let geom = Geometry::Point(point!(x: 0.1, y: 0.9));
        let values = index
            .what_contains(&geom)
            .into_iter()
            .map(|entry| entry.value)
            .collect::<Vec<_>>();
        assert_eq!(values, vec![1]);
    }

    #[test]
    fn contains_whole_shapes_too() {
        let index = index_of_squares();
        let small = Geometry::Polygon(polygon![
            (x: 0.1, y: 0.1),
            (x: 0.2, y: 0.1),
            (x: 0.2, y: 0.2),
            (x: 0.1, y: 0.2),
            (x: 0.1, y: 0.1),
        ]);
        let values = index
            .what_contains(&small)
            .into_iter()
            .map(|entry| entry.value)
            .collect::<Vec<_>>();
        assert_eq!(values, vec![1]);
    }

    #[test]
    fn empty_index_is_legal() {
        let index = SpatialIndex::<i64>::build(Vec::new()).unwrap();
        let geom = Geometry::Point(point!(x: 0.0, y: 0.0));
        assert!(index.what_contains(&geom).is_empty());
        assert!(index.first_contains(&geom).is_none());
        assert_eq!(index.num_coordinates(), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn degenerate_geometry_fails_the_build() {
        let empty = Geometry::MultiPolygon(MultiPolygon::<f64>(Vec::new()));
        let result = SpatialIndex::build(vec![SpatialEntry::new(empty, 1)]);
        assert!(matches!(result, Err(CacheError::Geometry(_))));
    }

    #[test]
    fn num_coordinates_sums_across_entries() {
        let index = index_of_squares();
        // Three closed squares of five coordinates each.
        assert_eq!(index.num_coordinates(), 15);
        assert_eq!(index.len(), 3);
    }
}
