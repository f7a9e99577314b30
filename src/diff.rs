// ============================================================================
// Diff : calcul d'un script d'édition minimal entre deux listes
// ============================================================================
// Les éléments sont identifiés par un id unique (uid du record) : le diff
// se ramène à un diff de listes à éléments uniques, en temps quasi linéaire.
//
// ALGORITHME :
// 1. id présent seulement dans old  → Delete
// 2. id présent seulement dans new  → Insert
// 3. id commun : on garde en place la plus longue sous-suite croissante
//    (LIS) des index old lus dans l'ordre de new. Les autres bougent :
//    Move si le contenu est égal, sinon Delete + Insert.
// 4. id commun resté en place avec un contenu différent → Update
// ============================================================================

use std::collections::{HashMap, HashSet};

use crate::models::ViewItem;

/// Élément comparable par le diff
pub trait Diffable {
    /// Identité stable (unique dans une liste)
    fn diff_id(&self) -> &str;

    /// Égalité des champs affichés
    fn content_equals(&self, other: &Self) -> bool;
}

impl Diffable for ViewItem {
    fn diff_id(&self) -> &str {
        &self.uid
    }

    fn content_equals(&self, other: &Self) -> bool {
        self == other
    }
}

/// Une opération du script
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    /// Index dans l'ancienne liste
    Delete { index: usize },

    /// Index dans la nouvelle liste
    Insert { index: usize, item: T },

    /// De l'ancienne liste vers la nouvelle, contenu inchangé
    Move { from: usize, to: usize },

    /// Index dans la nouvelle liste
    Update { index: usize, item: T },
}

/// Script d'édition transformant `old` en `new`
///
/// Ordre d'application (c'est l'ordre des `changes`) :
/// 1. Delete, index décroissants relatifs à `old` ; chaque Move retire aussi
///    son élément à l'index `from` de `old` dans cette phase
/// 2. Insert et Move, index `to` croissants relatifs à `new`
/// 3. Update, index relatifs à `new`
#[derive(Debug, Clone, PartialEq)]
pub struct EditScript<T> {
    pub changes: Vec<Change<T>>,
}

impl<T> Default for EditScript<T> {
    fn default() -> Self {
        Self { changes: Vec::new() }
    }
}

impl<T: Clone> EditScript<T> {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Applique le script à `old` et retourne la nouvelle liste
    pub fn apply(&self, old: &[T]) -> Vec<T> {
        let removed: HashSet<usize> = self
            .changes
            .iter()
            .filter_map(|change| match change {
                Change::Delete { index } => Some(*index),
                Change::Move { from, .. } => Some(*from),
                _ => None,
            })
            .collect();

        let mut list: Vec<T> = old
            .iter()
            .enumerate()
            .filter(|(index, _)| !removed.contains(index))
            .map(|(_, item)| item.clone())
            .collect();

        for change in &self.changes {
            match change {
                Change::Insert { index, item } => list.insert(*index, item.clone()),
                Change::Move { from, to } => list.insert(*to, old[*from].clone()),
                _ => {}
            }
        }

        for change in &self.changes {
            if let Change::Update { index, item } = change {
                list[*index] = item.clone();
            }
        }

        list
    }
}

/// Calcule le script d'édition entre deux listes à id uniques
pub fn diff<T: Diffable + Clone>(old: &[T], new: &[T]) -> EditScript<T> {
    let old_positions: HashMap<&str, usize> = old
        .iter()
        .enumerate()
        .map(|(index, item)| (item.diff_id(), index))
        .collect();
    let new_ids: HashSet<&str> = new.iter().map(Diffable::diff_id).collect();
    debug_assert_eq!(old_positions.len(), old.len(), "duplicate id in old list");
    debug_assert_eq!(new_ids.len(), new.len(), "duplicate id in new list");

    let mut deletes: Vec<usize> = old
        .iter()
        .enumerate()
        .filter(|(_, item)| !new_ids.contains(item.diff_id()))
        .map(|(index, _)| index)
        .collect();

    // Paires (index old, index new) des id communs, dans l'ordre de new
    let common: Vec<(usize, usize)> = new
        .iter()
        .enumerate()
        .filter_map(|(to, item)| old_positions.get(item.diff_id()).map(|from| (*from, to)))
        .collect();

    let old_order: Vec<usize> = common.iter().map(|(from, _)| *from).collect();
    let stable: HashSet<usize> = longest_increasing_subsequence(&old_order)
        .into_iter()
        .map(|position| common[position].1)
        .collect();

    // Insert et Move, déjà triés par index new croissant
    let mut placements: Vec<Change<T>> = Vec::new();
    let mut updates: Vec<Change<T>> = Vec::new();

    for (to, item) in new.iter().enumerate() {
        match old_positions.get(item.diff_id()) {
            None => placements.push(Change::Insert { index: to, item: item.clone() }),
            Some(&from) => {
                let same_content = old[from].content_equals(item);
                if stable.contains(&to) {
                    if !same_content {
                        updates.push(Change::Update { index: to, item: item.clone() });
                    }
                } else if same_content {
                    placements.push(Change::Move { from, to });
                } else {
                    deletes.push(from);
                    placements.push(Change::Insert { index: to, item: item.clone() });
                }
            }
        }
    }

    deletes.sort_unstable_by(|a, b| b.cmp(a));

    let mut changes: Vec<Change<T>> = deletes
        .into_iter()
        .map(|index| Change::Delete { index })
        .collect();
    changes.extend(placements);
    changes.extend(updates);

    EditScript { changes }
}

/// Positions d'une plus longue sous-suite strictement croissante (O(n log n))
fn longest_increasing_subsequence(values: &[usize]) -> Vec<usize> {
    // tails[k] = position de la plus petite fin d'une sous-suite de longueur k+1
    let mut tails: Vec<usize> = Vec::new();
    let mut previous: Vec<Option<usize>> = vec![None; values.len()];

    for (position, value) in values.iter().enumerate() {
        let length = tails.partition_point(|&tail| values[tail] < *value);
        if length > 0 {
            previous[position] = Some(tails[length - 1]);
        }
        if length == tails.len() {
            tails.push(position);
        } else {
            tails[length] = position;
        }
    }

    let mut result = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(position) = cursor {
        result.push(position);
        cursor = previous[position];
    }
    result.reverse();
    result
}
