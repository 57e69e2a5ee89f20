//! 뷰 프러스텀과 공간 판정
//!
//! 옥트리 셀(정육면체)에 대한 프러스텀 포함 판정, 전송 우선순위 계산,
//! LOD 경계 거리. 좌표 연산은 glam을 쓴다.

use glam::{Quat, Vec3};

use crate::wire::QueryMessage;

/// 뷰어가 원소 내부에 있을 때의 우선순위
pub const PRIORITY_VIEWER_INSIDE: f32 = 1.0e9;

/// 전송 금지 표지값 (유효 시야 뒤)
pub const PRIORITY_INVALID: f32 = f32::NEG_INFINITY;

/// 축 정렬 정육면체 (옥트리 셀)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cube {
    /// 최소 코너
    pub corner: Vec3,

    /// 한 변 길이
    pub scale: f32,
}

impl Cube {
    pub fn new(corner: Vec3, scale: f32) -> Self {
        Self { corner, scale }
    }

    /// 중심점
    pub fn center(&self) -> Vec3 {
        self.corner + Vec3::splat(self.scale * 0.5)
    }

    /// 점 포함 여부
    pub fn contains(&self, point: Vec3) -> bool {
        let max = self.corner + Vec3::splat(self.scale);
        point.cmpge(self.corner).all() && point.cmple(max).all()
    }

    /// 자식 옥탄트 셀
    ///
    /// 비트 0 = +X, 비트 1 = +Y, 비트 2 = +Z.
    pub fn child(&self, octant: u8) -> Cube {
        let half = self.scale * 0.5;
        let offset = Vec3::new(
            (octant & 1) as f32,
            ((octant >> 1) & 1) as f32,
            ((octant >> 2) & 1) as f32,
        ) * half;
        Cube {
            corner: self.corner + offset,
            scale: half,
        }
    }
}

/// 프러스텀 포함 판정 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    /// 완전히 내부
    Inside,
    /// 경계에 걸침
    Intersect,
    /// 완전히 외부
    Outside,
}

/// 뷰 프러스텀
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewFrustum {
    /// 뷰어 위치
    pub position: Vec3,

    /// 뷰어 방향
    pub orientation: Quat,

    /// 시야각 (도)
    pub fov_deg: f32,

    /// 근거리 클립
    pub near_clip: f32,

    /// 원거리 클립
    pub far_clip: f32,
}

/// 내부 표현: 평면 (내측 법선, 평면 위 한 점)
#[derive(Debug, Clone, Copy)]
struct Plane {
    normal: Vec3,
    point: Vec3,
}

impl ViewFrustum {
    pub fn new(position: Vec3, orientation: Quat, fov_deg: f32, near_clip: f32, far_clip: f32) -> Self {
        Self {
            position,
            orientation,
            fov_deg,
            near_clip,
            far_clip,
        }
    }

    /// 질의 메시지에서 변환
    pub fn from_query(query: &QueryMessage) -> Self {
        let [x, y, z] = query.position;
        let [qx, qy, qz, qw] = query.orientation;
        Self {
            position: Vec3::new(x, y, z),
            orientation: Quat::from_xyzw(qx, qy, qz, qw).normalize(),
            fov_deg: query.fov_deg,
            near_clip: query.near_clip,
            far_clip: query.far_clip,
        }
    }

    /// 전방 벡터 (-Z 기준)
    pub fn forward(&self) -> Vec3 {
        self.orientation * Vec3::NEG_Z
    }

    /// 상향 벡터
    pub fn up(&self) -> Vec3 {
        self.orientation * Vec3::Y
    }

    /// 우측 벡터
    pub fn right(&self) -> Vec3 {
        self.orientation * Vec3::X
    }

    /// 두 뷰가 사실상 같은지 (재순회 여부 판단용)
    pub fn very_similar(&self, other: &ViewFrustum, pos_epsilon: f32, angle_epsilon_deg: f32) -> bool {
        if self.position.distance(other.position) > pos_epsilon {
            return false;
        }
        if self.orientation.angle_between(other.orientation) > angle_epsilon_deg.to_radians() {
            return false;
        }
        (self.fov_deg - other.fov_deg).abs() < f32::EPSILON
            && (self.far_clip - other.far_clip).abs() < f32::EPSILON
    }

    /// 여섯 평면 (정사각 종횡비 가정)
    fn planes(&self) -> [Plane; 6] {
        let forward = self.forward();
        let up = self.up();
        let right = self.right();
        let half = (self.fov_deg * 0.5).to_radians();
        let (sin_h, cos_h) = half.sin_cos();

        let dir_right = forward * cos_h + right * sin_h;
        let dir_left = forward * cos_h - right * sin_h;
        let dir_top = forward * cos_h + up * sin_h;
        let dir_bottom = forward * cos_h - up * sin_h;

        [
            Plane {
                normal: forward,
                point: self.position + forward * self.near_clip,
            },
            Plane {
                normal: -forward,
                point: self.position + forward * self.far_clip,
            },
            Plane {
                normal: up.cross(dir_right).normalize(),
                point: self.position,
            },
            Plane {
                normal: dir_left.cross(up).normalize(),
                point: self.position,
            },
            Plane {
                normal: dir_top.cross(right).normalize(),
                point: self.position,
            },
            Plane {
                normal: right.cross(dir_bottom).normalize(),
                point: self.position,
            },
        ]
    }

    /// 정육면체 포함 판정
    pub fn classify(&self, cube: &Cube) -> Containment {
        let mut intersecting = false;
        for plane in self.planes() {
            let positive = cube.corner
                + Vec3::new(
                    if plane.normal.x > 0.0 { cube.scale } else { 0.0 },
                    if plane.normal.y > 0.0 { cube.scale } else { 0.0 },
                    if plane.normal.z > 0.0 { cube.scale } else { 0.0 },
                );
            if plane.normal.dot(positive - plane.point) < 0.0 {
                return Containment::Outside;
            }
            let negative = cube.corner
                + Vec3::new(
                    if plane.normal.x > 0.0 { 0.0 } else { cube.scale },
                    if plane.normal.y > 0.0 { 0.0 } else { cube.scale },
                    if plane.normal.z > 0.0 { 0.0 } else { cube.scale },
                );
            if plane.normal.dot(negative - plane.point) < 0.0 {
                intersecting = true;
            }
        }
        if intersecting {
            Containment::Intersect
        } else {
            Containment::Inside
        }
    }

    /// 전송 우선순위
    ///
    /// 뷰어가 셀 내부면 큰 상수, 유효 시야(원뿔 + 원소 각반경) 안이면
    /// 스케일/거리, 유효 시야 뒤면 전송 금지.
    pub fn priority_of(&self, cube: &Cube) -> f32 {
        if cube.contains(self.position) {
            return PRIORITY_VIEWER_INSIDE;
        }

        let offset = cube.center() - self.position;
        let distance = offset.length().max(1.0e-3);
        // 정육면체 외접구 반지름
        let radius = cube.scale * 0.5 * 3.0f32.sqrt();

        let half = (self.fov_deg * 0.5).to_radians();
        let angular_radius = (radius / distance).clamp(-1.0, 1.0).asin();
        let cos_to = (self.forward().dot(offset) / distance).clamp(-1.0, 1.0);

        if cos_to.acos() <= half + angular_radius {
            cube.scale / distance
        } else {
            PRIORITY_INVALID
        }
    }
}

/// 클라이언트별 LOD 파라미터
#[derive(Debug, Clone, Copy)]
pub struct DetailParams {
    /// 옥트리 크기 스케일 (경계 거리의 기준)
    pub size_scale: f32,

    /// 경계 레벨 보정
    pub boundary_level_adjust: i32,
}

impl Default for DetailParams {
    fn default() -> Self {
        Self {
            size_scale: 32768.0,
            boundary_level_adjust: 0,
        }
    }
}

impl DetailParams {
    /// 트리 레벨별 가시 경계 거리
    ///
    /// 이보다 멀면 해당 레벨 원소는 생략한다.
    pub fn boundary_distance(&self, level: i32) -> f32 {
        let effective = (level + self.boundary_level_adjust).max(0);
        self.size_scale / 2.0f32.powi(effective)
    }

    /// 해당 레벨 셀이 이 거리에서 보이는지
    pub fn visible_at(&self, level: i32, distance: f32) -> bool {
        distance <= self.boundary_distance(level)
    }
}
