//! 뷰 기반 트리 순회
//!
//! 클라이언트 뷰에 대한 옥트리 패스를 증분으로 진행한다. 순회는 락을
//! 스텝 구간 동안만 잡고, 구간 사이에는 트리 참조를 일절 보관하지
//! 않는다. 커서는 옥탄트 인덱스 스택이라서 재개할 때마다 루트에서
//! 다시 내려가 현재 트리에 대응시킨다. 그 사이 원소가 삭제됐으면
//! 커서를 남아 있는 조상까지 잘라내고 계속한다.
//!
//! 패스 종류
//! - FirstPass: 완료된 패스가 없을 때, 뷰 안 전체를 한 번씩 방문
//! - Continuation: 뷰가 거의 같을 때, 직전 완료 이후 변경분만
//! - DeltaPass: 뷰가 이동했을 때, 새 뷰에 들어왔거나 변경된 것만
//!   (이전 뷰에 완전히 덮여 있고 변경도 없는 서브트리는 건너뜀)

use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::frustum::{Containment, Cube, DetailParams, ViewFrustum, PRIORITY_INVALID};
use crate::tree::TreeElement;

/// 변경 시각 비교 여유 (1틱). 패스 완료 직전에 들어온 변경이
/// 타임스탬프 경합으로 빠지지 않게 한다.
const CHANGE_FUDGE_US: u64 = 16_666;

/// 패스 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalMode {
    /// 첫 전체 패스
    FirstPass,
    /// 같은 뷰 변경분 패스
    Continuation,
    /// 이동한 뷰 델타 패스
    DeltaPass,
}

/// 직전에 완료한 패스 정보
#[derive(Debug, Clone, Copy)]
pub struct CompletedPass {
    /// 완료 시점의 뷰
    pub view: ViewFrustum,

    /// 완료 시각 (마이크로초)
    pub at_us: u64,
}

/// 한 레벨의 커서: 부모에서의 옥탄트, 다음에 시도할 자식, 셀 기하
#[derive(Debug, Clone, Copy)]
struct Fork {
    octant: u8,
    next_child: u8,
    cube: Cube,
}

/// 순회가 반환한 원소
#[derive(Debug, Clone)]
pub struct Visit {
    /// 루트 기준 옥탄트 경로
    pub path: Vec<u8>,

    /// 원소 셀
    pub cube: Cube,
}

/// 우선순위 큐 항목. 우선순위 내림차순 최대 힙으로 쓴다.
#[derive(Debug, Clone)]
pub struct PrioritizedElement {
    pub priority: f32,
    pub path: Vec<u8>,
    pub cube: Cube,
}

impl PartialEq for PrioritizedElement {
    fn eq(&self, other: &Self) -> bool {
        self.priority.total_cmp(&other.priority) == std::cmp::Ordering::Equal
    }
}

impl Eq for PrioritizedElement {}

impl PartialOrd for PrioritizedElement {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedElement {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.total_cmp(&other.priority)
    }
}

/// 배치 스텝 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// 패스 완료
    Exhausted,
    /// 시간 예산 소진, 다음 틱에 재개
    BudgetSpent,
}

/// 진행 중인 트리 패스
#[derive(Debug)]
pub struct Traversal {
    mode: Option<TraversalMode>,
    forks: Vec<Fork>,
    started: bool,
    view: ViewFrustum,
    detail: DetailParams,
    root_cube: Cube,
    old_view: Option<ViewFrustum>,
    since_us: u64,
}

impl Traversal {
    /// 새 패스 시작. 직전 완료 패스와 뷰 유사도로 종류를 고른다.
    pub fn start(
        view: ViewFrustum,
        detail: DetailParams,
        root_cube: Cube,
        prior: Option<CompletedPass>,
        pos_epsilon: f32,
        angle_epsilon_deg: f32,
    ) -> Self {
        let mode = match &prior {
            None => TraversalMode::FirstPass,
            Some(pass) if view.very_similar(&pass.view, pos_epsilon, angle_epsilon_deg) => {
                TraversalMode::Continuation
            }
            Some(_) => TraversalMode::DeltaPass,
        };
        Self {
            mode: Some(mode),
            forks: Vec::new(),
            started: false,
            view,
            detail,
            root_cube,
            old_view: prior.as_ref().map(|pass| pass.view),
            since_us: prior.map(|pass| pass.at_us).unwrap_or(0),
        }
    }

    /// 진행 중인 패스 종류
    pub fn mode(&self) -> Option<TraversalMode> {
        self.mode
    }

    /// 패스가 진행 중인지
    pub fn is_active(&self) -> bool {
        self.mode.is_some()
    }

    fn effective_since(&self) -> u64 {
        self.since_us.saturating_sub(CHANGE_FUDGE_US)
    }

    fn finish(&mut self) {
        self.mode = None;
        self.forks.clear();
    }

    fn current_path(&self) -> Vec<u8> {
        self.forks.iter().skip(1).map(|fork| fork.octant).collect()
    }

    /// 이 서브트리로 내려갈지 판정 (시야, LOD, 모드별 스킵)
    fn enter_subtree(&self, element: &dyn TreeElement, cube: &Cube, level: i32) -> bool {
        if self.view.classify(cube) == Containment::Outside {
            return false;
        }
        let distance = cube.center().distance(self.view.position);
        if !self.detail.visible_at(level, distance) {
            return false;
        }
        match self.mode {
            Some(TraversalMode::Continuation) => {
                element.subtree_changed_at_us() > self.effective_since()
            }
            Some(TraversalMode::DeltaPass) => {
                let unchanged = element.subtree_changed_at_us() <= self.effective_since();
                let covered = match &self.old_view {
                    Some(old) => old.classify(cube) == Containment::Inside,
                    None => false,
                };
                !(unchanged && covered)
            }
            _ => true,
        }
    }

    /// 내려간 원소를 방문 결과로 내보낼지 판정
    fn should_visit(&self, element: &dyn TreeElement, cube: &Cube) -> bool {
        match self.mode {
            Some(TraversalMode::Continuation) => {
                element.changed_at_us() > self.effective_since()
            }
            Some(TraversalMode::DeltaPass) => {
                if element.changed_at_us() > self.effective_since() {
                    return true;
                }
                match &self.old_view {
                    Some(old) => old.classify(cube) != Containment::Inside,
                    None => true,
                }
            }
            _ => true,
        }
    }

    /// 다음 원소 하나를 방문. None이면 패스 소진.
    ///
    /// 호출자는 호출 동안 트리 읽기 락을 잡고 있어야 한다. 반환값은
    /// 소유 데이터라서 락 해제 후에도 쓸 수 있다.
    pub fn next(&mut self, root: &dyn TreeElement) -> Option<Visit> {
        self.mode?;

        if !self.started {
            self.started = true;
            let cube = self.root_cube;
            if !self.enter_subtree(root, &cube, 0) {
                self.finish();
                return None;
            }
            self.forks.push(Fork {
                octant: 0,
                next_child: 0,
                cube,
            });
            if self.should_visit(root, &cube) {
                return Some(Visit {
                    path: Vec::new(),
                    cube,
                });
            }
        }

        // 포크 체인을 현재 트리에 다시 대응. 중간 원소가 사라졌으면
        // 남은 조상까지 커서를 자른다.
        let mut elements: Vec<&dyn TreeElement> = Vec::with_capacity(self.forks.len());
        if !self.forks.is_empty() {
            elements.push(root);
            for fork in &self.forks[1..] {
                let parent = match elements.last() {
                    Some(parent) => *parent,
                    None => break,
                };
                match parent.child(fork.octant) {
                    Some(child) => elements.push(child),
                    None => break,
                }
            }
            self.forks.truncate(elements.len());
        }

        loop {
            let (next_child, parent_cube) = match self.forks.last() {
                Some(top) => (top.next_child, top.cube),
                None => {
                    self.finish();
                    return None;
                }
            };
            if next_child >= 8 {
                self.forks.pop();
                elements.pop();
                continue;
            }
            if let Some(top) = self.forks.last_mut() {
                top.next_child = next_child + 1;
            }
            let parent = match elements.last() {
                Some(parent) => *parent,
                None => {
                    self.finish();
                    return None;
                }
            };
            let child = match parent.child(next_child) {
                Some(child) => child,
                None => continue,
            };
            let cube = parent_cube.child(next_child);
            let level = self.forks.len() as i32;
            if !self.enter_subtree(child, &cube, level) {
                continue;
            }
            self.forks.push(Fork {
                octant: next_child,
                next_child: 0,
                cube,
            });
            elements.push(child);
            if self.should_visit(child, &cube) {
                return Some(Visit {
                    path: self.current_path(),
                    cube,
                });
            }
        }
    }

    /// 시간 예산 안에서 원소들을 방문해 우선순위 큐에 넣는다.
    ///
    /// 무효 우선순위(시야 원뿔 밖) 원소는 큐에 넣지 않고 버린다.
    /// 반환은 (결과, 방문 수). 예산이 0이어도 최소 한 스텝은 진행한다.
    pub fn next_batch(
        &mut self,
        root: &dyn TreeElement,
        queue: &mut BinaryHeap<PrioritizedElement>,
        budget: Duration,
    ) -> (BatchOutcome, u64) {
        let start = Instant::now();
        let mut visited = 0u64;
        loop {
            match self.next(root) {
                Some(visit) => {
                    visited += 1;
                    let priority = self.view.priority_of(&visit.cube);
                    if priority > PRIORITY_INVALID {
                        queue.push(PrioritizedElement {
                            priority,
                            path: visit.path,
                            cube: visit.cube,
                        });
                    }
                }
                None => return (BatchOutcome::Exhausted, visited),
            }
            if start.elapsed() >= budget {
                return (BatchOutcome::BudgetSpent, visited);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frustum::PRIORITY_VIEWER_INSIDE;
    use crate::tree::WorldContent;
    use crate::voxel::VoxelTree;
    use glam::{Quat, Vec3};

    /// 루트 셀 전체가 보이는 외부 시점
    fn outside_view() -> ViewFrustum {
        ViewFrustum::new(Vec3::new(0.0, 0.0, 500.0), Quat::IDENTITY, 90.0, 0.1, 2000.0)
    }

    /// 루트 셀 중심에서 -Z를 보는 내부 시점
    fn inside_view() -> ViewFrustum {
        ViewFrustum::new(Vec3::ZERO, Quat::IDENTITY, 90.0, 0.1, 500.0)
    }

    fn drain(traversal: &mut Traversal, tree: &VoxelTree) -> Vec<Vec<u8>> {
        let mut paths = Vec::new();
        while let Some(visit) = traversal.next(tree.root()) {
            paths.push(visit.path);
        }
        paths
    }

    #[test]
    fn test_first_pass_visits_every_element_once() {
        let mut tree = VoxelTree::with_default_bounds();
        tree.set_voxel(&[0], [1, 1, 1], 1000).unwrap();
        tree.set_voxel(&[1], [2, 2, 2], 1000).unwrap();
        tree.set_voxel(&[7, 7], [3, 3, 3], 1000).unwrap();

        let mut traversal = Traversal::start(
            outside_view(),
            DetailParams::default(),
            tree.root_cube(),
            None,
            0.1,
            1.0,
        );
        assert_eq!(traversal.mode(), Some(TraversalMode::FirstPass));

        let paths = drain(&mut traversal, &tree);
        // 전위 순서, 원소마다 정확히 한 번
        assert_eq!(
            paths,
            vec![vec![], vec![0], vec![1], vec![7], vec![7, 7]]
        );
        assert!(!traversal.is_active());
    }

    #[test]
    fn test_continuation_without_changes_visits_nothing() {
        let mut tree = VoxelTree::with_default_bounds();
        tree.set_voxel(&[0], [1, 1, 1], 1000).unwrap();
        tree.set_voxel(&[1], [2, 2, 2], 1000).unwrap();

        let view = outside_view();
        let prior = CompletedPass {
            view,
            at_us: 10_000_000,
        };
        let mut traversal = Traversal::start(
            view,
            DetailParams::default(),
            tree.root_cube(),
            Some(prior),
            0.1,
            1.0,
        );
        assert_eq!(traversal.mode(), Some(TraversalMode::Continuation));
        assert!(drain(&mut traversal, &tree).is_empty());
    }

    #[test]
    fn test_continuation_revisits_changed_branch_only() {
        let mut tree = VoxelTree::with_default_bounds();
        tree.set_voxel(&[0], [1, 1, 1], 1000).unwrap();
        tree.set_voxel(&[1, 2], [2, 2, 2], 1000).unwrap();

        let view = outside_view();
        let prior = CompletedPass {
            view,
            at_us: 10_000_000,
        };
        tree.set_voxel(&[1, 2], [9, 9, 9], 20_000_000).unwrap();

        let mut traversal = Traversal::start(
            view,
            DetailParams::default(),
            tree.root_cube(),
            Some(prior),
            0.1,
            1.0,
        );
        let paths = drain(&mut traversal, &tree);
        // 루트와 변경된 가지만, [0] 가지는 건너뜀
        assert_eq!(paths, vec![vec![], vec![1], vec![1, 2]]);
    }

    #[test]
    fn test_delta_pass_skips_covered_unchanged_subtree() {
        let mut tree = VoxelTree::with_default_bounds();
        // 두 잎 모두 이전 뷰에 완전히 들어가는 깊이의 셀
        tree.set_voxel(&[0, 7, 3, 7], [1, 1, 1], 1000).unwrap();
        tree.set_voxel(&[0, 7, 3, 3], [2, 2, 2], 1000).unwrap();

        let old_view = inside_view();
        let prior = CompletedPass {
            view: old_view,
            at_us: 10_000_000,
        };
        tree.set_voxel(&[0, 7, 3, 3], [9, 9, 9], 20_000_000).unwrap();

        let new_view = ViewFrustum::new(
            Vec3::new(0.5, 0.0, 0.0),
            Quat::IDENTITY,
            90.0,
            0.1,
            500.0,
        );
        let mut traversal = Traversal::start(
            new_view,
            DetailParams::default(),
            tree.root_cube(),
            Some(prior),
            0.1,
            1.0,
        );
        assert_eq!(traversal.mode(), Some(TraversalMode::DeltaPass));

        let paths = drain(&mut traversal, &tree);
        assert!(paths.contains(&vec![0, 7, 3, 3]));
        // 변경 없고 이전 뷰에 덮여 있던 잎은 건너뜀
        assert!(!paths.contains(&vec![0, 7, 3, 7]));
    }

    #[test]
    fn test_behind_viewer_subtree_culled() {
        let mut tree = VoxelTree::with_default_bounds();
        tree.set_voxel(&[0, 7], [1, 1, 1], 1000).unwrap();
        tree.set_voxel(&[4, 7], [2, 2, 2], 1000).unwrap();

        let mut traversal = Traversal::start(
            inside_view(),
            DetailParams::default(),
            tree.root_cube(),
            None,
            0.1,
            1.0,
        );
        let paths = drain(&mut traversal, &tree);
        assert!(paths.contains(&vec![0, 7]));
        // +Z 옥탄트는 뷰어 뒤라 서브트리째 컬링
        assert!(!paths.contains(&vec![4]));
        assert!(!paths.contains(&vec![4, 7]));
    }

    #[test]
    fn test_mutation_between_steps_recovers() {
        let mut tree = VoxelTree::with_default_bounds();
        tree.set_voxel(&[0, 0], [1, 1, 1], 1000).unwrap();
        tree.set_voxel(&[7, 7], [2, 2, 2], 1000).unwrap();

        let mut traversal = Traversal::start(
            outside_view(),
            DetailParams::default(),
            tree.root_cube(),
            None,
            0.1,
            1.0,
        );
        // 루트와 [0]까지 진행한 뒤 커서 아래 가지를 지운다
        assert_eq!(traversal.next(tree.root()).map(|v| v.path), Some(vec![]));
        assert_eq!(traversal.next(tree.root()).map(|v| v.path), Some(vec![0]));
        assert!(tree.erase_voxel(&[0, 0], 2000));

        let rest = drain(&mut traversal, &tree);
        assert!(rest.contains(&vec![7, 7]));
        assert!(!traversal.is_active());
    }

    #[test]
    fn test_priority_heap_orders_descending() {
        let cube = Cube::new(Vec3::ZERO, 1.0);
        let mut queue = BinaryHeap::new();
        for (priority, octant) in [(0.5f32, 0u8), (PRIORITY_VIEWER_INSIDE, 1), (2.0, 2)] {
            queue.push(PrioritizedElement {
                priority,
                path: vec![octant],
                cube,
            });
        }
        let order: Vec<u8> = std::iter::from_fn(|| queue.pop().map(|e| e.path[0])).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_batch_budget_yields_and_resumes() {
        let mut tree = VoxelTree::with_default_bounds();
        for a in 0..4u8 {
            for b in 0..4u8 {
                tree.set_voxel(&[a, b], [a, b, 0], 1000).unwrap();
            }
        }
        let total = tree.element_count() as u64;

        let mut traversal = Traversal::start(
            outside_view(),
            DetailParams::default(),
            tree.root_cube(),
            None,
            0.1,
            1.0,
        );
        let mut queue = BinaryHeap::new();

        // 예산 0이어도 최소 한 스텝은 진행
        let (outcome, first) =
            traversal.next_batch(tree.root(), &mut queue, Duration::ZERO);
        assert_eq!(outcome, BatchOutcome::BudgetSpent);
        assert_eq!(first, 1);

        let (outcome, rest) =
            traversal.next_batch(tree.root(), &mut queue, Duration::from_secs(5));
        assert_eq!(outcome, BatchOutcome::Exhausted);
        assert_eq!(first + rest, total);
        assert_eq!(queue.len() as u64, total);
    }

    #[test]
    fn test_mode_selection() {
        let cube = Cube::new(Vec3::splat(-128.0), 256.0);
        let view = outside_view();

        let fresh = Traversal::start(view, DetailParams::default(), cube, None, 0.1, 1.0);
        assert_eq!(fresh.mode(), Some(TraversalMode::FirstPass));

        let prior = CompletedPass { view, at_us: 1 };
        let same = Traversal::start(view, DetailParams::default(), cube, Some(prior), 0.1, 1.0);
        assert_eq!(same.mode(), Some(TraversalMode::Continuation));

        let moved = ViewFrustum::new(
            Vec3::new(10.0, 0.0, 500.0),
            Quat::IDENTITY,
            90.0,
            0.1,
            2000.0,
        );
        let delta = Traversal::start(moved, DetailParams::default(), cube, Some(prior), 0.1, 1.0);
        assert_eq!(delta.mode(), Some(TraversalMode::DeltaPass));
    }
}
