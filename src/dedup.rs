use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;

/// 削除結果。すでに存在しない場合も削除済みとして扱えるよう区別する。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deletion {
    Deleted,
    NotFound,
}

/// 重複排除の結果。
#[derive(Debug, PartialEq, Eq)]
pub struct Deduplicated<R> {
    /// 各グループから1件ずつ残すレコード。グループが最初に現れた順に並ぶ。
    pub survivors: Vec<R>,
    /// 削除対象のレコード。
    pub removals: Vec<R>,
}

/// 重複しているレコードを探す。
///
/// `fingerprint`が同じレコードを1グループとし、各グループで`keep`の値が最小のレコードを残す。
/// `keep`の値が同じ場合は先に現れたレコードを残す。
/// HashMapは検索にのみ利用し、出力順は入力順から決まるため、同じ入力には常に同じ結果を返す。
///
/// # Arguments
///
/// * `records` - 対象のレコード
/// * `fingerprint` - 重複判定キーを返す関数
/// * `keep` - 残すレコードを選ぶための順序キーを返す関数
pub fn find_duplicates<R, K, O>(
    records: Vec<R>,
    fingerprint: impl Fn(&R) -> K,
    keep: impl Fn(&R) -> O,
) -> Deduplicated<R>
where
    K: Eq + Hash,
    O: Ord,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<Vec<R>> = Vec::new();
    for record in records {
        match index.entry(fingerprint(&record)) {
            Entry::Occupied(slot) => groups[*slot.get()].push(record),
            Entry::Vacant(slot) => {
                slot.insert(groups.len());
                groups.push(vec![record]);
            }
        }
    }

    let mut survivors = Vec::with_capacity(groups.len());
    let mut removals = Vec::new();
    for mut group in groups {
        let position = group
            .iter()
            .enumerate()
            .min_by_key(|(_, record)| keep(record))
            .map(|(position, _)| position)
            .unwrap_or(0);
        survivors.push(group.remove(position));
        removals.extend(group);
    }

    Deduplicated {
        survivors,
        removals,
    }
}
