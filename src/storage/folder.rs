//! Folder hierarchy index.
//!
//! Folders of a namespace are kept as a Modified Preorder Tree Traversal:
//! each folder gets `(lft, rgt)` bounds so that a subtree is a single range
//! scan. The index is rebuilt from scratch inside the transaction of every
//! folder write.
//!
//! Numbering starts at a virtual root (uid `""`, `lft = 1`, depth 0) that
//! is never stored. Children are visited in ascending slug order and every
//! node satisfies `rgt = lft + 1 + 2 * descendants`. Folders whose parent
//! is unknown, or that only reach the root through a cycle, are numbered
//! afterwards as separate trees and flagged detached.

use std::collections::HashMap;

use sea_query::{Expr, Order, Query};
use tracing::{debug, warn};

use super::codec::{select_entity, EntityRow};
use super::db::{DbPool, Tx};
use super::schema::{Entity as E, EntityFolder};
use crate::config::FolderConfig;
use crate::error::Result;

/// A folder as loaded from the entity table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSource {
    pub guid: String,
    pub uid: String,
    pub parent_uid: String,
    pub title: String,
    pub slug: String,
}

/// One row of the folder index.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FolderInfo {
    pub guid: String,
    pub namespace: String,
    pub uid: String,
    pub parent_uid: String,
    pub title: String,
    pub slug_path: String,
    pub depth: i64,
    pub lft: i64,
    pub rgt: i64,
    pub detached: bool,
}

struct Node {
    source: FolderSource,
    children: Vec<usize>,
    visited: bool,
    depth: i64,
    lft: i64,
    rgt: i64,
    slug_path: String,
    detached: bool,
}

/// Compute the MPTT numbering for one namespace.
///
/// Output is in numbering order: the root tree first, then each detached
/// tree.
pub fn build_tree(namespace: &str, mut folders: Vec<FolderSource>) -> Vec<FolderInfo> {
    folders.sort_by(|a, b| a.slug.cmp(&b.slug).then_with(|| a.uid.cmp(&b.uid)));

    let mut nodes: Vec<Node> = folders
        .into_iter()
        .map(|source| Node {
            source,
            children: Vec::new(),
            visited: false,
            depth: 0,
            lft: 0,
            rgt: 0,
            slug_path: String::new(),
            detached: false,
        })
        .collect();

    let lookup: HashMap<String, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.source.uid.clone(), i))
        .collect();

    let mut top_level = Vec::new();
    let mut lost = Vec::new();
    for i in 0..nodes.len() {
        let parent = nodes[i].source.parent_uid.clone();
        if parent.is_empty() {
            top_level.push(i);
        } else if let Some(&p) = lookup.get(&parent) {
            if p == i {
                lost.push(i);
            } else {
                nodes[p].children.push(i);
            }
        } else {
            lost.push(i);
        }
    }

    // Virtual root occupies lft = 1.
    let mut idx = 1;
    let mut order = Vec::with_capacity(nodes.len());
    for &child in &top_level {
        idx = number(&mut nodes, child, idx + 1, 1, "", false, &mut order);
    }
    let root_rgt = idx + 1;

    let mut next = root_rgt;
    for &i in &lost {
        if !nodes[i].visited {
            next = number(&mut nodes, i, next + 1, 1, "", true, &mut order);
        }
    }
    // Anything left only hangs off a cycle.
    for i in 0..nodes.len() {
        if !nodes[i].visited {
            next = number(&mut nodes, i, next + 1, 1, "", true, &mut order);
        }
    }

    order
        .into_iter()
        .map(|i| {
            let n = &nodes[i];
            FolderInfo {
                guid: n.source.guid.clone(),
                namespace: namespace.to_string(),
                uid: n.source.uid.clone(),
                parent_uid: n.source.parent_uid.clone(),
                title: n.source.title.clone(),
                slug_path: n.slug_path.clone(),
                depth: n.depth,
                lft: n.lft,
                rgt: n.rgt,
                detached: n.detached,
            }
        })
        .collect()
}

/// Number `i` and its subtree starting at `idx`; returns the node's `rgt`.
fn number(
    nodes: &mut [Node],
    i: usize,
    idx: i64,
    depth: i64,
    parent_path: &str,
    detached: bool,
    order: &mut Vec<usize>,
) -> i64 {
    let slug_path = format!("{parent_path}/{}", nodes[i].source.slug);
    {
        let node = &mut nodes[i];
        node.visited = true;
        node.lft = idx;
        node.depth = depth;
        node.detached = detached;
        node.slug_path = slug_path.clone();
    }
    order.push(i);

    let mut last = idx;
    let children = nodes[i].children.clone();
    for child in children {
        if nodes[child].visited {
            continue;
        }
        last = number(nodes, child, last + 1, depth + 1, &slug_path, detached, order);
    }
    nodes[i].rgt = last + 1;
    last + 1
}

impl From<&EntityRow> for FolderSource {
    fn from(row: &EntityRow) -> Self {
        let slug = if row.slug.is_empty() {
            row.name.clone()
        } else {
            row.slug.clone()
        };
        Self {
            guid: row.guid.clone(),
            uid: row.name.clone(),
            parent_uid: row.folder.clone(),
            title: row.title.clone(),
            slug,
        }
    }
}

/// Recompute and store the folder index of `namespace`.
#[tracing::instrument(skip(tx, folders))]
pub async fn rebuild_namespace(tx: &mut Tx, folders: &FolderConfig, namespace: &str) -> Result<()> {
    let delete = Query::delete()
        .from_table(EntityFolder::Table)
        .and_where(Expr::col(EntityFolder::Namespace).eq(namespace))
        .to_owned();
    tx.execute(&delete).await?;

    let select = select_entity(E::Table)
        .and_where(Expr::col(E::Group).eq(folders.group.as_str()))
        .and_where(Expr::col(E::Resource).eq(folders.resource.as_str()))
        .and_where(Expr::col(E::Namespace).eq(namespace))
        .and_where(Expr::col(E::Subresource).eq(""))
        .to_owned();
    let rows: Vec<EntityRow> = tx.fetch_all(&select).await?;
    let sources = rows.iter().map(FolderSource::from).collect();

    let tree = build_tree(namespace, sources);
    let detached = tree.iter().filter(|f| f.detached).count();
    if detached > 0 {
        warn!(namespace, detached, "folders with unknown parents indexed as detached");
    }
    if tree.is_empty() {
        return Ok(());
    }

    let mut insert = Query::insert();
    insert.into_table(EntityFolder::Table).columns([
        EntityFolder::Guid,
        EntityFolder::Namespace,
        EntityFolder::Uid,
        EntityFolder::ParentUid,
        EntityFolder::Title,
        EntityFolder::SlugPath,
        EntityFolder::Depth,
        EntityFolder::Lft,
        EntityFolder::Rgt,
        EntityFolder::Detached,
    ]);
    for f in &tree {
        insert.values_panic([
            f.guid.as_str().into(),
            f.namespace.as_str().into(),
            f.uid.as_str().into(),
            f.parent_uid.as_str().into(),
            f.title.as_str().into(),
            f.slug_path.as_str().into(),
            f.depth.into(),
            f.lft.into(),
            f.rgt.into(),
            f.detached.into(),
        ]);
    }
    tx.execute(&insert).await?;
    debug!(namespace, folders = tree.len(), "folder index rebuilt");
    Ok(())
}

const FOLDER_COLUMNS: [EntityFolder; 10] = [
    EntityFolder::Guid,
    EntityFolder::Namespace,
    EntityFolder::Uid,
    EntityFolder::ParentUid,
    EntityFolder::Title,
    EntityFolder::SlugPath,
    EntityFolder::Depth,
    EntityFolder::Lft,
    EntityFolder::Rgt,
    EntityFolder::Detached,
];

/// Read side of the folder index.
#[derive(Clone, Debug)]
pub struct FolderIndex {
    db: DbPool,
}

impl FolderIndex {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Every indexed folder of the namespace, in tree order.
    pub async fn list(&self, namespace: &str) -> Result<Vec<FolderInfo>> {
        let select = Query::select()
            .columns(FOLDER_COLUMNS)
            .from(EntityFolder::Table)
            .and_where(Expr::col(EntityFolder::Namespace).eq(namespace))
            .order_by(EntityFolder::Lft, Order::Asc)
            .to_owned();
        self.db.fetch_all(&select).await
    }

    /// The folder `uid` and all of its descendants, in tree order.
    ///
    /// Empty when the folder is not indexed.
    pub async fn subtree(&self, namespace: &str, uid: &str) -> Result<Vec<FolderInfo>> {
        let select = Query::select()
            .columns(FOLDER_COLUMNS)
            .from(EntityFolder::Table)
            .and_where(Expr::col(EntityFolder::Namespace).eq(namespace))
            .and_where(Expr::col(EntityFolder::Uid).eq(uid))
            .to_owned();
        let Some(top) = self.db.fetch_optional::<FolderInfo, _>(&select).await? else {
            return Ok(Vec::new());
        };

        let select = Query::select()
            .columns(FOLDER_COLUMNS)
            .from(EntityFolder::Table)
            .and_where(Expr::col(EntityFolder::Namespace).eq(namespace))
            .and_where(Expr::col(EntityFolder::Lft).gte(top.lft))
            .and_where(Expr::col(EntityFolder::Rgt).lte(top.rgt))
            .order_by(EntityFolder::Lft, Order::Asc)
            .to_owned();
        self.db.fetch_all(&select).await
    }
}
