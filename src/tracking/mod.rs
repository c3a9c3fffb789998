use std::sync::Arc;

use async_shutdown::ShutdownManager;
use glam::{Quat, Vec3};
use tokio::sync::{mpsc, watch};

use crate::config::Hand;

pub use self::history::{PoseHistory, PoseRecord};

pub mod history;

/// Device path identifiers, hashed the same way on both ends of the wire.
pub const LEFT_HAND_PATH: u64 = fnv1a("/user/hand/left");
pub const RIGHT_HAND_PATH: u64 = fnv1a("/user/hand/right");

const FLAG_BATTERY: u32 = 1 << 0;
const FLAG_VELOCITIES: u32 = 1 << 1;
const FLAG_LEFT_SKELETON: u32 = 1 << 2;
const FLAG_RIGHT_SKELETON: u32 = 1 << 3;

const MOTION_SIZE: usize = 13 * 4;
const FIXED_SIZE: usize = 8 + 4 + 4 + 3 * MOTION_SIZE + 8;
const SKELETON_JOINTS: usize = 26;
const SKELETON_SIZE: usize = SKELETON_JOINTS * 16;

const fn fnv1a(path: &str) -> u64 {
	let mut hash = 0xcbf2_9ce4_8422_2325u64;
	let bytes = path.as_bytes();
	let mut i = 0;
	while i < bytes.len() {
		hash ^= bytes[i] as u64;
		hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
		i += 1;
	}
	hash
}

pub fn path_for_hand(hand: Hand) -> u64 {
	match hand {
		Hand::Left => LEFT_HAND_PATH,
		Hand::Right => RIGHT_HAND_PATH,
	}
}

pub fn hand_from_path(path: u64) -> Option<Hand> {
	if path == LEFT_HAND_PATH {
		Some(Hand::Left)
	} else if path == RIGHT_HAND_PATH {
		Some(Hand::Right)
	} else {
		None
	}
}

/// Position and orientation of a tracked device, with optional velocities.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceMotion {
	pub position: Vec3,
	pub orientation: Quat,
	pub linear_velocity: Option<Vec3>,
	pub angular_velocity: Option<Vec3>,
}

#[derive(Clone, Copy, Debug)]
pub struct ControllerState {
	pub path: u64,
	pub hand: Hand,
	pub motion: DeviceMotion,
}

#[derive(Clone, Copy, Debug)]
pub struct HandSkeleton {
	pub joint_orientations: [Quat; SKELETON_JOINTS],
}

/// One parsed TRACKING datagram.
#[derive(Clone, Copy, Debug)]
pub struct TrackingPacket {
	pub target_timestamp_ns: u64,
	pub head_motion: DeviceMotion,
	pub controller_motions: [DeviceMotion; 2],
	pub buttons: u64,
	pub battery_gauge: Option<f32>,
	pub hand_skeletons: [Option<HandSkeleton>; 2],
}

impl TrackingPacket {
	/// Parses the packed little-endian layout. Short or inconsistent
	/// buffers are rejected, never panicked on.
	pub fn parse(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < FIXED_SIZE {
			tracing::warn!("Tracking packet too short: {} bytes, expected at least {FIXED_SIZE}.", buffer.len());
			return Err(());
		}

		let target_timestamp_ns = u64::from_le_bytes(buffer[0..8].try_into().unwrap());
		let flags = u32::from_le_bytes(buffer[8..12].try_into().unwrap());
		let battery = f32::from_le_bytes(buffer[12..16].try_into().unwrap());

		let with_velocities = flags & FLAG_VELOCITIES != 0;
		let head_motion = parse_motion(&buffer[16..16 + MOTION_SIZE], with_velocities);
		let controller_motions = [
			parse_motion(&buffer[16 + MOTION_SIZE..16 + 2 * MOTION_SIZE], with_velocities),
			parse_motion(&buffer[16 + 2 * MOTION_SIZE..16 + 3 * MOTION_SIZE], with_velocities),
		];
		let buttons = u64::from_le_bytes(buffer[FIXED_SIZE - 8..FIXED_SIZE].try_into().unwrap());

		let mut offset = FIXED_SIZE;
		let mut hand_skeletons = [None, None];
		for (index, flag) in [(0, FLAG_LEFT_SKELETON), (1, FLAG_RIGHT_SKELETON)] {
			if flags & flag == 0 {
				continue;
			}
			if buffer.len() < offset + SKELETON_SIZE {
				tracing::warn!("Tracking packet truncated inside hand skeleton {index}.");
				return Err(());
			}
			hand_skeletons[index] = Some(parse_skeleton(&buffer[offset..offset + SKELETON_SIZE]));
			offset += SKELETON_SIZE;
		}

		Ok(Self {
			target_timestamp_ns,
			head_motion,
			controller_motions,
			buttons,
			battery_gauge: (flags & FLAG_BATTERY != 0).then_some(battery),
			hand_skeletons,
		})
	}

	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		let mut flags = 0u32;
		if self.battery_gauge.is_some() {
			flags |= FLAG_BATTERY;
		}
		if self.head_motion.linear_velocity.is_some() {
			flags |= FLAG_VELOCITIES;
		}
		if self.hand_skeletons[0].is_some() {
			flags |= FLAG_LEFT_SKELETON;
		}
		if self.hand_skeletons[1].is_some() {
			flags |= FLAG_RIGHT_SKELETON;
		}

		buffer.extend(self.target_timestamp_ns.to_le_bytes());
		buffer.extend(flags.to_le_bytes());
		buffer.extend(self.battery_gauge.unwrap_or(0.0).to_le_bytes());
		serialize_motion(&self.head_motion, buffer);
		serialize_motion(&self.controller_motions[0], buffer);
		serialize_motion(&self.controller_motions[1], buffer);
		buffer.extend(self.buttons.to_le_bytes());
		for skeleton in self.hand_skeletons.iter().flatten() {
			for joint in &skeleton.joint_orientations {
				for component in joint.to_array() {
					buffer.extend(component.to_le_bytes());
				}
			}
		}
	}
}

fn parse_motion(buffer: &[u8], with_velocities: bool) -> DeviceMotion {
	let f = |i: usize| f32::from_le_bytes(buffer[i * 4..i * 4 + 4].try_into().unwrap());

	DeviceMotion {
		position: Vec3::new(f(0), f(1), f(2)),
		orientation: Quat::from_xyzw(f(3), f(4), f(5), f(6)),
		linear_velocity: with_velocities.then(|| Vec3::new(f(7), f(8), f(9))),
		angular_velocity: with_velocities.then(|| Vec3::new(f(10), f(11), f(12))),
	}
}

fn serialize_motion(motion: &DeviceMotion, buffer: &mut Vec<u8>) {
	for value in [motion.position.x, motion.position.y, motion.position.z] {
		buffer.extend(value.to_le_bytes());
	}
	for value in motion.orientation.to_array() {
		buffer.extend(value.to_le_bytes());
	}
	let linear = motion.linear_velocity.unwrap_or(Vec3::ZERO);
	let angular = motion.angular_velocity.unwrap_or(Vec3::ZERO);
	for value in [linear.x, linear.y, linear.z, angular.x, angular.y, angular.z] {
		buffer.extend(value.to_le_bytes());
	}
}

fn parse_skeleton(buffer: &[u8]) -> HandSkeleton {
	let mut joint_orientations = [Quat::IDENTITY; SKELETON_JOINTS];
	for (joint, orientation) in joint_orientations.iter_mut().enumerate() {
		let f = |i: usize| f32::from_le_bytes(buffer[joint * 16 + i * 4..joint * 16 + i * 4 + 4].try_into().unwrap());
		*orientation = Quat::from_xyzw(f(0), f(1), f(2), f(3));
	}
	HandSkeleton { joint_orientations }
}

/// The latest tracking state, published for the host runtime's pose
/// update path.
#[derive(Clone, Copy, Debug)]
pub struct TrackingUpdate {
	pub frame_id: u64,
	pub target_timestamp_ns: u64,
	pub head_motion: DeviceMotion,
	pub controllers: [ControllerState; 2],
	pub buttons: u64,
	pub battery_gauge: Option<f32>,
}

/// Receives tracking packets from the transport, records render poses and
/// republishes the newest device state.
pub struct TrackingIngest {
	pose_history: Arc<PoseHistory>,
	controller_hands: [Hand; 2],
	update_tx: watch::Sender<Option<TrackingUpdate>>,
}

impl TrackingIngest {
	pub fn new(pose_history: Arc<PoseHistory>, controller_hands: [Hand; 2]) -> Self {
		let (update_tx, _) = watch::channel(None);
		Self { pose_history, controller_hands, update_tx }
	}

	pub fn subscribe(&self) -> watch::Receiver<Option<TrackingUpdate>> {
		self.update_tx.subscribe()
	}

	pub async fn run<R: Clone + Send + Sync + 'static>(
		self,
		mut tracking_rx: mpsc::Receiver<Vec<u8>>,
		shutdown: ShutdownManager<R>,
	) {
		let _delay_stop = shutdown.delay_shutdown_token();

		while let Ok(Some(packet)) = shutdown.wrap_cancel(tracking_rx.recv()).await {
			let _ = self.handle_packet(&packet);
		}

		tracing::debug!("Tracking ingest stopped.");
	}

	/// Parses one TRACKING payload and folds it into the pose history.
	/// Returns the frame id assigned to the head pose.
	pub fn handle_packet(&self, packet: &[u8]) -> Result<u64, ()> {
		let tracking = TrackingPacket::parse(packet)?;
		let frame_id = self.pose_history.record(tracking.head_motion, tracking.target_timestamp_ns);

		let controllers = [0, 1].map(|index| {
			let path = path_for_hand(self.controller_hands[index]);
			ControllerState {
				path,
				// The path constants are the only accepted values, so this
				// cannot fall through.
				hand: hand_from_path(path).unwrap_or(self.controller_hands[index]),
				motion: tracking.controller_motions[index],
			}
		});

		if let Some(gauge) = tracking.battery_gauge {
			tracing::trace!("Client battery at {:.0}%.", gauge * 100.0);
		}

		self.update_tx.send_replace(Some(TrackingUpdate {
			frame_id,
			target_timestamp_ns: tracking.target_timestamp_ns,
			head_motion: tracking.head_motion,
			controllers,
			buttons: tracking.buttons,
			battery_gauge: tracking.battery_gauge,
		}));

		Ok(frame_id)
	}
}
