//! An order-64 B+ tree keyed by `i64`, backing the in-memory quad index.
//!
//! Pages live in a per-tree arena addressed by `u32` ids and are recycled
//! through free-lists, so steady-state mutation does not allocate. Leaves
//! form a doubly linked list for ordered enumeration in both directions.
//!
//! Enumerators are detached cursors: they capture the last yielded key and
//! the tree's version counter, and re-seek on that key whenever the tree
//! has been mutated underneath them. Once an enumerator is exhausted it
//! stays exhausted, even if the tree grows afterwards.

use std::cmp::Ordering;

/// Index pages hold up to `2*KX + 1` separator keys.
pub const KX: usize = 32;
/// Data pages hold up to `2*KD` entries (one extra slot absorbs an insert
/// before a split).
pub const KD: usize = 32;

/// Three-way key comparator.
pub type Cmp = fn(i64, i64) -> Ordering;

fn default_cmp(a: i64, b: i64) -> Ordering {
    a.cmp(&b)
}

type PageId = u32;
const NONE: PageId = u32::MAX;

#[derive(Debug)]
struct DataPage<V> {
    items: Vec<(i64, V)>,
    prev: PageId,
    next: PageId,
}

#[derive(Debug)]
struct IndexPage {
    keys: Vec<i64>,
    /// Always `keys.len() + 1` children while the page is live.
    children: Vec<PageId>,
}

#[derive(Debug)]
enum Page<V> {
    Data(DataPage<V>),
    Index(IndexPage),
}

#[derive(Debug)]
pub struct Tree<V> {
    cmp: Cmp,
    pages: Vec<Page<V>>,
    free_data: Vec<PageId>,
    free_index: Vec<PageId>,
    root: PageId,
    first: PageId,
    last: PageId,
    len: usize,
    ver: u64,
}

impl<V> Default for Tree<V> {
    fn default() -> Self {
        Tree::new()
    }
}

impl<V> Tree<V> {
    pub fn new() -> Tree<V> {
        Tree::with_cmp(default_cmp)
    }

    pub fn with_cmp(cmp: Cmp) -> Tree<V> {
        Tree {
            cmp,
            pages: Vec::new(),
            free_data: Vec::new(),
            free_index: Vec::new(),
            root: NONE,
            first: NONE,
            last: NONE,
            len: 0,
            ver: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Monotonically increasing structural version, advanced by every
    /// mutation that can move entries between slots.
    pub fn version(&self) -> u64 {
        self.ver
    }

    // ---- page arena ----

    fn data(&self, id: PageId) -> &DataPage<V> {
        match &self.pages[id as usize] {
            Page::Data(d) => d,
            Page::Index(_) => unreachable!("data page expected"),
        }
    }

    fn data_mut(&mut self, id: PageId) -> &mut DataPage<V> {
        match &mut self.pages[id as usize] {
            Page::Data(d) => d,
            Page::Index(_) => unreachable!("data page expected"),
        }
    }

    fn index(&self, id: PageId) -> &IndexPage {
        match &self.pages[id as usize] {
            Page::Index(x) => x,
            Page::Data(_) => unreachable!("index page expected"),
        }
    }

    fn index_mut(&mut self, id: PageId) -> &mut IndexPage {
        match &mut self.pages[id as usize] {
            Page::Index(x) => x,
            Page::Data(_) => unreachable!("index page expected"),
        }
    }

    fn is_index(&self, id: PageId) -> bool {
        matches!(self.pages[id as usize], Page::Index(_))
    }

    fn alloc_data(&mut self) -> PageId {
        if let Some(id) = self.free_data.pop() {
            let d = self.data_mut(id);
            d.prev = NONE;
            d.next = NONE;
            return id;
        }
        let id = self.pages.len() as PageId;
        self.pages.push(Page::Data(DataPage {
            items: Vec::with_capacity(2 * KD + 1),
            prev: NONE,
            next: NONE,
        }));
        id
    }

    fn alloc_index(&mut self) -> PageId {
        if let Some(id) = self.free_index.pop() {
            return id;
        }
        let id = self.pages.len() as PageId;
        self.pages.push(Page::Index(IndexPage {
            keys: Vec::with_capacity(2 * KX + 2),
            children: Vec::with_capacity(2 * KX + 3),
        }));
        id
    }

    fn free_data_page(&mut self, id: PageId) {
        let d = self.data_mut(id);
        d.items.clear();
        d.prev = NONE;
        d.next = NONE;
        self.free_data.push(id);
    }

    fn free_index_page(&mut self, id: PageId) {
        let x = self.index_mut(id);
        x.keys.clear();
        x.children.clear();
        self.free_index.push(id);
    }

    // ---- search ----

    fn find(&self, id: PageId, k: i64) -> (usize, bool) {
        let cmp = self.cmp;
        match &self.pages[id as usize] {
            Page::Index(x) => binary_search(&x.keys, k, cmp, |ks, i| ks[i]),
            Page::Data(d) => binary_search(&d.items, k, cmp, |it, i| it[i].0),
        }
    }

    pub fn get(&self, k: i64) -> Option<&V> {
        let mut q = self.root;
        if q == NONE {
            return None;
        }
        loop {
            let (i, found) = self.find(q, k);
            if self.is_index(q) {
                let x = self.index(q);
                q = if found { x.children[i + 1] } else { x.children[i] };
                continue;
            }
            let d = self.data(q);
            return if found { Some(&d.items[i].1) } else { None };
        }
    }

    pub fn contains(&self, k: i64) -> bool {
        self.get(k).is_some()
    }

    /// First entry in key order.
    pub fn first(&self) -> Option<(i64, &V)> {
        if self.first == NONE {
            return None;
        }
        let (k, v) = &self.data(self.first).items[0];
        Some((*k, v))
    }

    /// Last entry in key order.
    pub fn last(&self) -> Option<(i64, &V)> {
        if self.last == NONE {
            return None;
        }
        let (k, v) = self.data(self.last).items.last()?;
        Some((*k, v))
    }

    // ---- mutation ----

    /// Inserts or overwrites the value under `k`.
    pub fn set(&mut self, k: i64, v: V) {
        if self.root == NONE {
            let id = self.alloc_data();
            self.insert_data(id, 0, k, v);
            self.root = id;
            self.first = id;
            self.last = id;
            return;
        }
        let mut p: PageId = NONE;
        let mut pi: usize = 0;
        let mut q = self.root;
        loop {
            let (mut i, found) = self.find(q, k);
            if found {
                if self.is_index(q) {
                    let mut x = q;
                    if self.index(x).keys.len() > 2 * KX {
                        let (nx, ni) = self.split_index(p, x, pi, i);
                        x = nx;
                        i = ni;
                    }
                    pi = i + 1;
                    p = x;
                    q = self.index(x).children[i + 1];
                    continue;
                }
                self.data_mut(q).items[i].1 = v;
                return;
            }
            if self.is_index(q) {
                let mut x = q;
                if self.index(x).keys.len() > 2 * KX {
                    let (nx, ni) = self.split_index(p, x, pi, i);
                    x = nx;
                    i = ni;
                }
                pi = i;
                p = x;
                q = self.index(x).children[i];
            } else {
                if self.data(q).items.len() < 2 * KD {
                    self.insert_data(q, i, k, v);
                } else {
                    self.overflow(p, q, pi, i, k, v);
                }
                return;
            }
        }
    }

    /// Atomic read-modify-write in a single walk. `upd` receives the
    /// existing value, if any, and returns the new value to store, or
    /// `None` to leave the tree untouched. Returns whether a write
    /// happened.
    pub fn put(&mut self, k: i64, upd: impl FnOnce(Option<&V>) -> Option<V>) -> bool {
        let mut upd = Some(upd);
        let mut apply = |old: Option<&V>| (upd.take().expect("updater called once"))(old);
        if self.root == NONE {
            let Some(v) = apply(None) else {
                return false;
            };
            let id = self.alloc_data();
            self.insert_data(id, 0, k, v);
            self.root = id;
            self.first = id;
            self.last = id;
            return true;
        }
        let mut p: PageId = NONE;
        let mut pi: usize = 0;
        let mut q = self.root;
        loop {
            let (mut i, found) = self.find(q, k);
            if self.is_index(q) {
                let mut x = q;
                if self.index(x).keys.len() > 2 * KX {
                    let (nx, ni) = self.split_index(p, x, pi, i);
                    x = nx;
                    i = ni;
                }
                if found {
                    pi = i + 1;
                } else {
                    pi = i;
                }
                p = x;
                q = self.index(x).children[pi];
                continue;
            }
            if found {
                let Some(v) = apply(Some(&self.data(q).items[i].1)) else {
                    return false;
                };
                self.data_mut(q).items[i].1 = v;
            } else {
                let Some(v) = apply(None) else {
                    return false;
                };
                if self.data(q).items.len() < 2 * KD {
                    self.insert_data(q, i, k, v);
                } else {
                    self.overflow(p, q, pi, i, k, v);
                }
            }
            return true;
        }
    }

    /// Removes the entry under `k`, returning whether it existed.
    pub fn delete(&mut self, k: i64) -> bool {
        let mut p: PageId = NONE;
        let mut pi: usize = 0;
        let mut q = self.root;
        if q == NONE {
            return false;
        }
        loop {
            let (mut i, found) = self.find(q, k);
            if found {
                if self.is_index(q) {
                    let mut x = q;
                    if self.index(x).keys.len() < KX && x != self.root {
                        let (nx, ni) = self.underflow_index(p, x, pi, i);
                        x = nx;
                        i = ni;
                    }
                    pi = i + 1;
                    p = x;
                    q = self.index(x).children[i + 1];
                    continue;
                }
                self.extract_data(q, i);
                if self.data(q).items.len() >= KD {
                    return true;
                }
                if q != self.root {
                    self.underflow_data(p, q, pi);
                } else if self.len == 0 {
                    self.clear();
                }
                return true;
            }
            if self.is_index(q) {
                let mut x = q;
                if self.index(x).keys.len() < KX && x != self.root {
                    let (nx, ni) = self.underflow_index(p, x, pi, i);
                    x = nx;
                    i = ni;
                }
                pi = i;
                p = x;
                q = self.index(x).children[i];
            } else {
                return false;
            }
        }
    }

    /// Removes all entries, returning every page to the free-lists.
    pub fn clear(&mut self) {
        if self.root == NONE {
            return;
        }
        self.clr(self.root);
        self.root = NONE;
        self.first = NONE;
        self.last = NONE;
        self.len = 0;
        self.ver += 1;
    }

    fn clr(&mut self, id: PageId) {
        if self.is_index(id) {
            let children = self.index(id).children.clone();
            for ch in children {
                self.clr(ch);
            }
            self.free_index_page(id);
        } else {
            self.free_data_page(id);
        }
    }

    fn insert_data(&mut self, q: PageId, i: usize, k: i64, v: V) {
        self.ver += 1;
        self.data_mut(q).items.insert(i, (k, v));
        self.len += 1;
    }

    fn extract_data(&mut self, q: PageId, i: usize) -> (i64, V) {
        self.ver += 1;
        self.len -= 1;
        self.data_mut(q).items.remove(i)
    }

    fn data_siblings(&self, p: PageId, pi: usize) -> (PageId, PageId) {
        if p == NONE {
            return (NONE, NONE);
        }
        let pp = self.index(p);
        let l = if pi > 0 { pp.children[pi - 1] } else { NONE };
        let r = if pi < pp.keys.len() {
            pp.children[pi + 1]
        } else {
            NONE
        };
        (l, r)
    }

    /// A full leaf absorbs an insert by shifting one entry to a sibling
    /// with room; only when both siblings are full does it split.
    fn overflow(&mut self, p: PageId, q: PageId, pi: usize, i: usize, k: i64, v: V) {
        let (l, r) = self.data_siblings(p, pi);
        if l != NONE && self.data(l).items.len() < 2 * KD && i != 0 {
            self.ver += 1;
            let moved = self.data_mut(q).items.remove(0);
            self.data_mut(l).items.push(moved);
            self.insert_data(q, i - 1, k, v);
            self.index_mut(p).keys[pi - 1] = self.data(q).items[0].0;
            return;
        }
        if r != NONE && self.data(r).items.len() < 2 * KD {
            if i < 2 * KD {
                self.ver += 1;
                let moved = self.data_mut(q).items.pop().expect("full page");
                self.data_mut(r).items.insert(0, moved);
                self.insert_data(q, i, k, v);
                self.index_mut(p).keys[pi] = self.data(r).items[0].0;
            } else {
                self.insert_data(r, 0, k, v);
                self.index_mut(p).keys[pi] = k;
            }
            return;
        }
        self.split_data(p, q, pi, i, k, v);
    }

    fn split_data(&mut self, p: PageId, q: PageId, pi: usize, i: usize, k: i64, v: V) {
        self.ver += 1;
        let r = self.alloc_data();
        let qnext = self.data(q).next;
        {
            let rp = self.data_mut(r);
            rp.next = qnext;
            rp.prev = q;
        }
        if qnext != NONE {
            self.data_mut(qnext).prev = r;
        } else {
            self.last = r;
        }
        self.data_mut(q).next = r;

        let tail = self.data_mut(q).items.split_off(KD);
        self.data_mut(r).items.extend(tail);
        if i > KD {
            self.insert_data(r, i - KD, k, v);
            let sep = self.data(r).items[0].0;
            if p != NONE {
                let pp = self.index_mut(p);
                pp.keys.insert(pi, sep);
                pp.children.insert(pi + 1, r);
            } else {
                let nr = self.alloc_index();
                let np = self.index_mut(nr);
                np.keys.push(sep);
                np.children.push(q);
                np.children.push(r);
                self.root = nr;
            }
        } else {
            let sep = self.data(r).items[0].0;
            if p != NONE {
                let pp = self.index_mut(p);
                pp.keys.insert(pi, sep);
                pp.children.insert(pi + 1, r);
            } else {
                let nr = self.alloc_index();
                let np = self.index_mut(nr);
                np.keys.push(sep);
                np.children.push(q);
                np.children.push(r);
                self.root = nr;
            }
            self.insert_data(q, i, k, v);
        }
    }

    /// Splits a full index page around its middle key, which moves up to
    /// the parent (or becomes a new root). Returns the page and slot where
    /// the descent for `i` continues.
    fn split_index(&mut self, p: PageId, q: PageId, pi: usize, i: usize) -> (PageId, usize) {
        self.ver += 1;
        let r = self.alloc_index();
        let (mid, keys_tail, children_tail) = {
            let qp = self.index_mut(q);
            let keys_tail = qp.keys.split_off(KX + 1);
            let children_tail = qp.children.split_off(KX + 1);
            let mid = qp.keys.pop().expect("separator key");
            (mid, keys_tail, children_tail)
        };
        {
            let rp = self.index_mut(r);
            rp.keys.extend(keys_tail);
            rp.children.extend(children_tail);
        }
        if p != NONE {
            let pp = self.index_mut(p);
            pp.keys.insert(pi, mid);
            pp.children.insert(pi + 1, r);
        } else {
            let nr = self.alloc_index();
            let np = self.index_mut(nr);
            np.keys.push(mid);
            np.children.push(q);
            np.children.push(r);
            self.root = nr;
        }
        match i.cmp(&KX) {
            Ordering::Less => (q, i),
            Ordering::Equal => {
                if p != NONE {
                    (p, pi)
                } else {
                    (self.root, 0)
                }
            }
            Ordering::Greater => (r, i - KX - 1),
        }
    }

    /// A leaf that fell below `KD` entries borrows from a sibling when the
    /// pair still holds `2*KD` entries, and merges otherwise.
    fn underflow_data(&mut self, p: PageId, q: PageId, pi: usize) {
        let (l, r) = self.data_siblings(p, pi);
        if l != NONE && self.data(l).items.len() + self.data(q).items.len() >= 2 * KD {
            self.ver += 1;
            let moved = self.data_mut(l).items.pop().expect("nonempty sibling");
            self.data_mut(q).items.insert(0, moved);
            self.index_mut(p).keys[pi - 1] = self.data(q).items[0].0;
        } else if r != NONE && self.data(q).items.len() + self.data(r).items.len() >= 2 * KD {
            self.ver += 1;
            let moved = self.data_mut(r).items.remove(0);
            self.data_mut(q).items.push(moved);
            self.index_mut(p).keys[pi] = self.data(r).items[0].0;
        } else if l != NONE {
            self.cat_data(p, l, q, pi - 1);
        } else {
            self.cat_data(p, q, r, pi);
        }
    }

    /// Merges leaf `r` into its left sibling `q` and drops the separator
    /// at `pi` from the parent. The parent is the root when it is down to
    /// its final separator, in which case `q` becomes the new root.
    fn cat_data(&mut self, p: PageId, q: PageId, r: PageId, pi: usize) {
        self.ver += 1;
        let rnext = self.data(r).next;
        let items = std::mem::take(&mut self.data_mut(r).items);
        self.data_mut(q).items.extend(items);
        if rnext != NONE {
            self.data_mut(rnext).prev = q;
        } else {
            self.last = q;
        }
        self.data_mut(q).next = rnext;
        self.free_data_page(r);
        if self.index(p).keys.len() > 1 {
            let pp = self.index_mut(p);
            pp.keys.remove(pi);
            pp.children.remove(pi + 1);
        } else {
            self.free_index_page(p);
            self.root = q;
        }
    }

    /// Rebalances an index page that fell below `KX` separators before the
    /// descent passes through it. Returns the page and slot where the
    /// descent for `i` continues.
    fn underflow_index(&mut self, p: PageId, q: PageId, pi: usize, mut i: usize) -> (PageId, usize) {
        let mut l = NONE;
        let mut r = NONE;
        if p != NONE {
            let pp = self.index(p);
            if pi > 0 {
                l = pp.children[pi - 1];
            }
            if pi < pp.keys.len() {
                r = pp.children[pi + 1];
            }
        }
        if l != NONE && self.index(l).keys.len() > KX {
            self.ver += 1;
            let lchild = self.index_mut(l).children.pop().expect("child");
            let lkey = self.index_mut(l).keys.pop().expect("key");
            let pkey = std::mem::replace(&mut self.index_mut(p).keys[pi - 1], lkey);
            let qp = self.index_mut(q);
            qp.children.insert(0, lchild);
            qp.keys.insert(0, pkey);
            return (q, i + 1);
        }
        if r != NONE && self.index(r).keys.len() > KX {
            self.ver += 1;
            let rchild = self.index_mut(r).children.remove(0);
            let rkey = self.index_mut(r).keys.remove(0);
            let pkey = std::mem::replace(&mut self.index_mut(p).keys[pi], rkey);
            let qp = self.index_mut(q);
            qp.keys.push(pkey);
            qp.children.push(rchild);
            return (q, i);
        }
        if l != NONE {
            i += self.index(l).keys.len() + 1;
            self.cat_index(p, l, q, pi - 1);
            return (l, i);
        }
        self.cat_index(p, q, r, pi);
        (q, i)
    }

    fn cat_index(&mut self, p: PageId, q: PageId, r: PageId, pi: usize) {
        self.ver += 1;
        let sep = self.index(p).keys[pi];
        let (keys, children) = {
            let rp = self.index_mut(r);
            (std::mem::take(&mut rp.keys), std::mem::take(&mut rp.children))
        };
        {
            let qp = self.index_mut(q);
            qp.keys.push(sep);
            qp.keys.extend(keys);
            qp.children.extend(children);
        }
        self.free_index_page(r);
        if self.index(p).keys.len() > 1 {
            let pp = self.index_mut(p);
            pp.keys.remove(pi);
            pp.children.remove(pi + 1);
        } else {
            self.free_index_page(p);
            self.root = q;
        }
    }

    // ---- enumeration ----

    /// Positions an enumerator on the first entry with key >= `k`; the
    /// flag reports an exact hit.
    pub fn seek(&self, k: i64) -> (Enumerator, bool) {
        let mut q = self.root;
        if q == NONE {
            return (Enumerator::detached(k, self.ver), false);
        }
        loop {
            let (i, found) = self.find(q, k);
            if found {
                if self.is_index(q) {
                    q = self.index(q).children[i + 1];
                    continue;
                }
                return (
                    Enumerator {
                        page: q,
                        i,
                        k,
                        hit: true,
                        ver: self.ver,
                        done: false,
                    },
                    true,
                );
            }
            if self.is_index(q) {
                q = self.index(q).children[i];
            } else {
                return (
                    Enumerator {
                        page: q,
                        i,
                        k,
                        hit: false,
                        ver: self.ver,
                        done: false,
                    },
                    false,
                );
            }
        }
    }

    /// An enumerator on the first entry, or `None` for an empty tree.
    pub fn seek_first(&self) -> Option<Enumerator> {
        if self.first == NONE {
            return None;
        }
        Some(Enumerator {
            page: self.first,
            i: 0,
            k: self.data(self.first).items[0].0,
            hit: true,
            ver: self.ver,
            done: false,
        })
    }

    /// An enumerator on the last entry, or `None` for an empty tree.
    pub fn seek_last(&self) -> Option<Enumerator> {
        if self.last == NONE {
            return None;
        }
        let i = self.data(self.last).items.len() - 1;
        Some(Enumerator {
            page: self.last,
            i,
            k: self.data(self.last).items[i].0,
            hit: true,
            ver: self.ver,
            done: false,
        })
    }

    /// Borrowing in-order iterator; the borrow freezes the tree, so no
    /// resynchronization is involved.
    pub fn iter(&self) -> TreeIter<'_, V> {
        TreeIter {
            tree: self,
            page: self.first,
            i: 0,
        }
    }
}

fn binary_search<T>(slice: &[T], k: i64, cmp: Cmp, key_at: impl Fn(&[T], usize) -> i64) -> (usize, bool) {
    let mut lo = 0usize;
    let mut hi = slice.len();
    while lo < hi {
        let m = (lo + hi) / 2;
        match cmp(k, key_at(slice, m)) {
            Ordering::Greater => lo = m + 1,
            Ordering::Equal => return (m, true),
            Ordering::Less => hi = m,
        }
    }
    (lo, false)
}

/// A detached cursor over a [`Tree`]. Pass the same tree to every call;
/// the cursor re-seeks on its last yielded key when the tree's version has
/// advanced since.
#[derive(Debug, Clone)]
pub struct Enumerator {
    page: PageId,
    i: usize,
    k: i64,
    hit: bool,
    ver: u64,
    done: bool,
}

impl Enumerator {
    fn detached(k: i64, ver: u64) -> Enumerator {
        Enumerator {
            page: NONE,
            i: 0,
            k,
            hit: false,
            ver,
            done: false,
        }
    }

    /// Yields the current entry and moves forward. Exhaustion is sticky.
    pub fn next<V: Clone>(&mut self, t: &Tree<V>) -> Option<(i64, V)> {
        if self.done {
            return None;
        }
        if self.ver != t.ver {
            let (mut f, hit) = t.seek(self.k);
            if !self.hit && hit && !f.advance(t) {
                // the last yielded key is still the last entry
                f.page = NONE;
            }
            *self = f;
        }
        if self.page == NONE {
            self.done = true;
            return None;
        }
        if self.i >= t.data(self.page).items.len() && !self.advance(t) {
            self.done = true;
            return None;
        }
        let (k, v) = t.data(self.page).items[self.i].clone();
        self.k = k;
        self.hit = false;
        if !self.advance(t) {
            self.done = true;
        }
        Some((k, v))
    }

    /// Yields the current entry and moves backward. Exhaustion is sticky.
    pub fn prev<V: Clone>(&mut self, t: &Tree<V>) -> Option<(i64, V)> {
        if self.done {
            return None;
        }
        if self.ver != t.ver {
            let (mut f, hit) = t.seek(self.k);
            // Unless the cursor still points at a not-yet-yielded exact
            // hit, the re-seek position is at or past the last yielded
            // key; step back below it.
            if !(hit && self.hit) && !f.retreat(t) {
                f.page = NONE;
            }
            *self = f;
        }
        if self.page == NONE {
            self.done = true;
            return None;
        }
        if self.i >= t.data(self.page).items.len() && !self.retreat(t) {
            self.done = true;
            return None;
        }
        let (k, v) = t.data(self.page).items[self.i].clone();
        self.k = k;
        self.hit = false;
        if !self.retreat(t) {
            self.done = true;
        }
        Some((k, v))
    }

    fn advance<V>(&mut self, t: &Tree<V>) -> bool {
        if self.page == NONE {
            return false;
        }
        if self.i + 1 < t.data(self.page).items.len() {
            self.i += 1;
            return true;
        }
        let next = t.data(self.page).next;
        if next == NONE {
            return false;
        }
        self.page = next;
        self.i = 0;
        true
    }

    fn retreat<V>(&mut self, t: &Tree<V>) -> bool {
        if self.page == NONE {
            return false;
        }
        if self.i > 0 {
            self.i -= 1;
            return true;
        }
        let prev = t.data(self.page).prev;
        if prev == NONE {
            return false;
        }
        self.page = prev;
        self.i = t.data(prev).items.len() - 1;
        true
    }
}

pub struct TreeIter<'a, V> {
    tree: &'a Tree<V>,
    page: PageId,
    i: usize,
}

impl<'a, V> Iterator for TreeIter<'a, V> {
    type Item = (i64, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.page == NONE {
            return None;
        }
        let d = self.tree.data(self.page);
        if self.i >= d.items.len() {
            self.page = d.next;
            self.i = 0;
            return self.next();
        }
        let (k, v) = &d.items[self.i];
        self.i += 1;
        Some((*k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::collections::BTreeMap;

    fn keys_in_order(t: &Tree<u64>) -> Vec<i64> {
        t.iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn set_get_round_trip() {
        let mut t = Tree::new();
        for k in [5i64, 1, 9, 3, 7] {
            t.set(k, (k * 10) as u64);
        }
        assert_eq!(t.len(), 5);
        for k in [5i64, 1, 9, 3, 7] {
            assert_eq!(t.get(k), Some(&((k * 10) as u64)));
        }
        assert_eq!(t.get(4), None);
        t.set(5, 999);
        assert_eq!(t.get(5), Some(&999));
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn inorder_equals_sorted_after_delete_and_reinsert() {
        let mut t = Tree::new();
        for k in [5i64, 1, 9, 3, 7] {
            t.set(k, 0u64);
        }
        assert!(t.delete(3));
        assert_eq!(keys_in_order(&t), vec![1, 5, 7, 9]);
        t.set(3, 0);
        assert_eq!(keys_in_order(&t), vec![1, 3, 5, 7, 9]);
        assert!(!t.delete(42));
    }

    #[test]
    fn put_single_walk() {
        let mut t: Tree<u64> = Tree::new();
        let wrote = t.put(7, |old| {
            assert!(old.is_none());
            Some(1)
        });
        assert!(wrote);
        let wrote = t.put(7, |old| old.map(|v| v + 1));
        assert!(wrote);
        assert_eq!(t.get(7), Some(&2));
        let wrote = t.put(8, |_| None);
        assert!(!wrote);
        assert_eq!(t.get(8), None);
    }

    #[test]
    fn seek_positions_on_first_key_geq() {
        let mut t = Tree::new();
        for k in (0..100i64).step_by(10) {
            t.set(k, k as u64);
        }
        let (mut e, hit) = t.seek(35);
        assert!(!hit);
        assert_eq!(e.next(&t), Some((40, 40)));
        let (mut e, hit) = t.seek(40);
        assert!(hit);
        assert_eq!(e.next(&t), Some((40, 40)));
        let (mut e, hit) = t.seek(1000);
        assert!(!hit);
        assert_eq!(e.next(&t), None);
        // sticky exhaustion
        t.set(2000, 0);
        assert_eq!(e.next(&t), None);
    }

    #[test]
    fn forward_and_backward_enumeration() {
        let mut t = Tree::new();
        let mut want: Vec<i64> = (0..500).map(|i| i * 3).collect();
        want.shuffle(&mut StdRng::seed_from_u64(7));
        for &k in &want {
            t.set(k, k as u64);
        }
        want.sort_unstable();

        let mut e = t.seek_first().expect("nonempty");
        let mut got = Vec::new();
        while let Some((k, _)) = e.next(&t) {
            got.push(k);
        }
        assert_eq!(got, want);

        let mut e = t.seek_last().expect("nonempty");
        let mut got = Vec::new();
        while let Some((k, _)) = e.prev(&t) {
            got.push(k);
        }
        let mut rev = want.clone();
        rev.reverse();
        assert_eq!(got, rev);
    }

    #[test]
    fn enumerator_resyncs_after_mutation() {
        let mut t = Tree::new();
        for k in 0..10i64 {
            t.set(k, k as u64);
        }
        let mut e = t.seek_first().expect("nonempty");
        assert_eq!(e.next(&t), Some((0, 0)));
        assert_eq!(e.next(&t), Some((1, 1)));

        // delete the key the enumerator would yield next, plus one more
        t.delete(2);
        t.delete(3);
        assert_eq!(e.next(&t), Some((4, 4)));

        // reinsert a key behind the cursor; it must not re-appear
        t.set(2, 200);
        assert_eq!(e.next(&t), Some((5, 5)));

        // a value overwrite is not a structural change
        t.set(6, 600);
        assert_eq!(e.next(&t), Some((6, 600)));

        // insert a new key ahead of the cursor; it must be yielded
        t.delete(8);
        t.set(8, 800);
        let rest: Vec<i64> = std::iter::from_fn(|| e.next(&t).map(|(k, _)| k)).collect();
        assert_eq!(rest, vec![7, 8, 9]);
    }

    #[test]
    fn enumerator_resync_on_deleted_cursor_key() {
        let mut t = Tree::new();
        for k in 0..8i64 {
            t.set(k, 0u64);
        }
        let mut e = t.seek_first().expect("nonempty");
        assert_eq!(e.next(&t).map(|(k, _)| k), Some(0));
        // the last yielded key disappears; the cursor lands on its successor
        t.delete(0);
        t.delete(1);
        assert_eq!(e.next(&t).map(|(k, _)| k), Some(2));
    }

    #[test]
    fn deep_tree_split_and_merge() {
        let mut t = Tree::new();
        let n = 20_000i64;
        for k in 0..n {
            t.set(k, k as u64);
        }
        assert_eq!(t.len(), n as usize);
        for k in (0..n).step_by(2) {
            assert!(t.delete(k));
        }
        assert_eq!(t.len(), n as usize / 2);
        for k in 0..n {
            assert_eq!(t.get(k).is_some(), k % 2 == 1, "key {k}");
        }
        let got = keys_in_order(&t);
        let want: Vec<i64> = (0..n).filter(|k| k % 2 == 1).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn pages_are_recycled() {
        let mut t = Tree::new();
        for k in 0..10_000i64 {
            t.set(k, 0u64);
        }
        let allocated = t.pages.len();
        for k in 0..10_000i64 {
            t.delete(k);
        }
        for k in 0..10_000i64 {
            t.set(k, 0u64);
        }
        // the rebuild reuses freed pages instead of growing the arena
        assert_eq!(t.pages.len(), allocated);
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.seek_first().map(|_| ()), None);
    }

    #[test]
    fn random_soak_against_btreemap() {
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let mut t = Tree::new();
        let mut model: BTreeMap<i64, u64> = BTreeMap::new();
        for _ in 0..50_000 {
            let k = rng.gen_range(-2_000i64..2_000);
            if rng.gen_bool(0.6) {
                let v = rng.gen::<u64>();
                t.set(k, v);
                model.insert(k, v);
            } else {
                assert_eq!(t.delete(k), model.remove(&k).is_some());
            }
        }
        assert_eq!(t.len(), model.len());
        let got: Vec<(i64, u64)> = t.iter().map(|(k, v)| (k, *v)).collect();
        let want: Vec<(i64, u64)> = model.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(got, want);

        // spot-check point lookups and a backward walk
        for _ in 0..1_000 {
            let k = rng.gen_range(-2_000i64..2_000);
            assert_eq!(t.get(k), model.get(&k));
        }
        let mut e = t.seek_last().expect("nonempty");
        let mut back = Vec::new();
        while let Some((k, _)) = e.prev(&t) {
            back.push(k);
        }
        let mut fwd: Vec<i64> = model.keys().copied().collect();
        fwd.reverse();
        assert_eq!(back, fwd);
    }

    #[test]
    fn custom_comparator_reverses_order() {
        fn rev(a: i64, b: i64) -> std::cmp::Ordering {
            b.cmp(&a)
        }
        let mut t: Tree<u64> = Tree::with_cmp(rev);
        for k in [1i64, 2, 3] {
            t.set(k, 0);
        }
        assert_eq!(keys_in_order(&t), vec![3, 2, 1]);
        assert_eq!(t.get(2), Some(&0));
    }
}
