/// Disjoint-set forest over `0..len` with path compression and union by rank
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Representative of the set containing `x`
    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Point every node on the path straight at the root
        let mut current = x;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    /// Merge the sets containing `a` and `b`, returning the new representative
    pub fn union(&mut self, a: usize, b: usize) -> usize {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return a;
        }
        match self.rank[a].cmp(&self.rank[b]) {
            std::cmp::Ordering::Less => {
                self.parent[a] = b;
                b
            }
            std::cmp::Ordering::Greater => {
                self.parent[b] = a;
                a
            }
            std::cmp::Ordering::Equal => {
                self.parent[b] = a;
                self.rank[a] += 1;
                a
            }
        }
    }

    /// Members of every set, each set sorted ascending and the sets ordered by their smallest member
    pub fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: Vec<Option<usize>> = vec![None; self.len()];
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for x in 0..self.len() {
            let root = self.find(x);
            match by_root[root] {
                Some(index) => groups[index].push(x),
                None => {
                    by_root[root] = Some(groups.len());
                    groups.push(vec![x]);
                }
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons() {
        let mut sets = UnionFind::new(3);
        assert_eq!(sets.groups(), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_union_is_transitive() {
        let mut sets = UnionFind::new(6);
        sets.union(4, 1);
        sets.union(1, 5);
        sets.union(2, 3);
        assert_eq!(sets.find(4), sets.find(5));
        assert_ne!(sets.find(0), sets.find(5));
        assert_eq!(sets.groups(), vec![vec![0], vec![1, 4, 5], vec![2, 3]]);
    }

    #[test]
    fn test_find_compresses_paths() {
        let mut sets = UnionFind::new(4);
        // Build a chain without going through union so the path is long
        sets.parent = vec![0, 0, 1, 2];
        let root = sets.find(3);
        assert_eq!(root, 0);
        assert_eq!(sets.parent, vec![0, 0, 0, 0]);
    }
}
