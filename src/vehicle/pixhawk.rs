//! Live vehicle: a PX4 or ArduPilot autopilot (real or SITL) spoken to over
//! MAVLink.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use async_trait::async_trait;
use mavlink::{ardupilotmega as apm, MavHeader, MavlinkVersion};
use serde::Deserialize;
use tokio::{
    select,
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{
    interface::{parse_version, PixhawkInterface, PixhawkReader},
    wait_for_state, MissionIndex, Vehicle, VehicleState,
};
use crate::{
    state::{CameraAction, GeoPoint, MissionPlan},
    task::{spawn_task, Task},
    util::ReceiverExt,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PixhawkConfig {
    /// Local address to listen on for the autopilot's packets
    pub address: SocketAddr,
    pub mavlink: String,
    pub target_system: u8,
    pub target_component: u8,
    /// How long to wait for each acknowledgement, in seconds
    pub command_timeout_s: u64,
}

impl Default for PixhawkConfig {
    fn default() -> Self {
        PixhawkConfig {
            address: SocketAddr::from(([0, 0, 0, 0], 14540)),
            mavlink: "V2".to_owned(),
            target_system: 1,
            target_component: 1,
            command_timeout_s: 10,
        }
    }
}

/// How the uploaded mission items map back onto plan waypoints.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MissionLayout {
    waypoint_of_item: Vec<usize>,
    final_nav_item: Option<u16>,
}

impl MissionLayout {
    pub fn waypoint_for(&self, seq: u16) -> Option<usize> {
        self.waypoint_of_item.get(seq as usize).copied()
    }

    fn last_item(&self) -> Option<u16> {
        (self.waypoint_of_item.len() as u16).checked_sub(1)
    }

    /// Whether reaching `seq` ends the mission.
    pub fn is_final(&self, seq: u16) -> bool {
        self.last_item() == Some(seq)
    }

    /// Camera commands are never reported as reached. One that trails the
    /// final waypoint ends the mission once it becomes current, which the
    /// autopilot only does after reaching that waypoint.
    pub fn ends_when_current(&self, seq: u16) -> bool {
        self.is_final(seq) && self.final_nav_item != Some(seq)
    }
}

/// The system and component on the link that flies the vehicle. Ground
/// stations, cameras and companion computers may share the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Autopilot {
    system: u8,
    component: u8,
}

impl From<&PixhawkConfig> for Autopilot {
    fn from(config: &PixhawkConfig) -> Self {
        Autopilot {
            system: config.target_system,
            component: config.target_component,
        }
    }
}

/// Expands a plan into MAVLink mission items. Each waypoint becomes a speed
/// change, the navigation item itself and, if requested, a camera command.
pub fn mission_items(
    plan: &MissionPlan,
    target_system: u8,
    target_component: u8,
) -> (Vec<apm::MISSION_ITEM_INT_DATA>, MissionLayout) {
    let mut items = Vec::with_capacity(plan.len() * 3);
    let mut waypoint_of_item = Vec::with_capacity(plan.len() * 3);
    let mut final_nav_item = None;

    let mut push = |items: &mut Vec<apm::MISSION_ITEM_INT_DATA>,
                    waypoint: usize,
                    command: apm::MavCmd,
                    params: [f32; 4],
                    position: Option<(GeoPoint, f32)>| {
        let seq = items.len() as u16;
        let (x, y, z) = match position {
            Some((p, altitude)) => (
                (p.latitude() * 1e7).round() as i32,
                (p.longitude() * 1e7).round() as i32,
                altitude,
            ),
            None => (0, 0, 0.0),
        };

        items.push(apm::MISSION_ITEM_INT_DATA {
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            x,
            y,
            z,
            seq,
            command,
            target_system,
            target_component,
            frame: apm::MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            current: if seq == 0 { 1 } else { 0 },
            autocontinue: 1,
            ..Default::default()
        });
        waypoint_of_item.push(waypoint);
        seq
    };

    for (index, wp) in plan.waypoints().iter().enumerate() {
        // speed type 1 is ground speed, -1 leaves the throttle alone
        push(
            &mut items,
            index,
            apm::MavCmd::MAV_CMD_DO_CHANGE_SPEED,
            [1.0, wp.speed_m_s as f32, -1.0, 0.0],
            None,
        );

        let nav = push(
            &mut items,
            index,
            apm::MavCmd::MAV_CMD_NAV_WAYPOINT,
            [wp.hold_s() as f32, 0.0, 0.0, f32::NAN],
            Some((wp.position, wp.altitude_rel_m as f32)),
        );
        final_nav_item = Some(nav);

        match wp.camera_action {
            CameraAction::None => {}
            CameraAction::TakePhoto => {
                push(
                    &mut items,
                    index,
                    apm::MavCmd::MAV_CMD_IMAGE_START_CAPTURE,
                    [0.0, 0.0, 1.0, 0.0],
                    None,
                );
            }
            CameraAction::StartVideo => {
                push(
                    &mut items,
                    index,
                    apm::MavCmd::MAV_CMD_VIDEO_START_CAPTURE,
                    [0.0, 0.0, 0.0, 0.0],
                    None,
                );
            }
            CameraAction::StopVideo => {
                push(
                    &mut items,
                    index,
                    apm::MavCmd::MAV_CMD_VIDEO_STOP_CAPTURE,
                    [0.0, 0.0, 0.0, 0.0],
                    None,
                );
            }
        }
    }

    (
        items,
        MissionLayout {
            waypoint_of_item,
            final_nav_item,
        },
    )
}

/// Applies one message from the link to the vehicle state. Messages from
/// other systems are ignored.
fn apply_message(
    state: &mut VehicleState,
    layout: &MissionLayout,
    autopilot: Autopilot,
    header: &MavHeader,
    message: &apm::MavMessage,
) {
    if header.system_id != autopilot.system {
        return;
    }

    match message {
        apm::MavMessage::HEARTBEAT(data) => {
            if header.component_id != autopilot.component
                || data.autopilot == apm::MavAutopilot::MAV_AUTOPILOT_INVALID
            {
                return;
            }

            state.connected = true;
            state.armed = data
                .base_mode
                .contains(apm::MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
        }
        apm::MavMessage::GLOBAL_POSITION_INT(data) => {
            // lat and lon are in degrees * 10^7
            if data.lat == 0 && data.lon == 0 {
                return;
            }

            match GeoPoint::new(data.lat as f64 / 1e7, data.lon as f64 / 1e7) {
                Ok(position) => {
                    state.global_position_ok = true;
                    state.record_position(position);
                }
                Err(err) => debug!("ignoring global position: {err}"),
            }
        }
        apm::MavMessage::HOME_POSITION(data) => {
            match GeoPoint::new(data.latitude as f64 / 1e7, data.longitude as f64 / 1e7) {
                Ok(home) => {
                    state.home = Some(home);
                    state.home_position_ok = true;
                }
                Err(err) => debug!("ignoring home position: {err}"),
            }
        }
        apm::MavMessage::MISSION_CURRENT(data) => {
            // the autopilot reports item 0 as current before the mission runs
            if state.mission_index == MissionIndex::NotStarted {
                return;
            }

            if layout.ends_when_current(data.seq) {
                state.advance_to(MissionIndex::Finished);
            } else if let Some(waypoint) = layout.waypoint_for(data.seq) {
                state.advance_to(MissionIndex::Active(waypoint));
            }
        }
        apm::MavMessage::MISSION_ITEM_REACHED(data) => {
            if state.active_waypoint().is_some() && layout.is_final(data.seq) {
                state.advance_to(MissionIndex::Finished);
            }
        }
        _ => {}
    }
}

/// Applies a message and wakes state watchers only if something changed.
fn publish(
    state_tx: &watch::Sender<VehicleState>,
    layout: &MissionLayout,
    autopilot: Autopilot,
    header: &MavHeader,
    message: &apm::MavMessage,
) -> bool {
    state_tx.send_if_modified(|state| {
        let before = state.clone();
        apply_message(state, layout, autopilot, header, message);
        *state != before
    })
}

/// Reads the link and publishes what the autopilot reports.
struct EventTask {
    reader: PixhawkReader,
    autopilot: Autopilot,
    state_tx: Arc<watch::Sender<VehicleState>>,
    layout_rx: watch::Receiver<MissionLayout>,
    msg_tx: broadcast::Sender<apm::MavMessage>,
}

#[async_trait]
impl Task for EventTask {
    fn name(&self) -> &'static str {
        "pixhawk/event"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            mut reader,
            autopilot,
            state_tx,
            layout_rx,
            msg_tx,
        } = *self;

        let loop_fut = async move {
            loop {
                let (header, message) = reader.recv().await?;

                publish(
                    &state_tx,
                    &layout_rx.borrow(),
                    autopilot,
                    &header,
                    &message,
                );

                // nobody waiting on a reply is fine
                let _ = msg_tx.send(message);
            }

            #[allow(unreachable_code)]
            Ok::<_, anyhow::Error>(())
        };

        select! {
          _ = cancel.cancelled() => {}
          res = loop_fut => { res? }
        }

        Ok(())
    }
}

pub struct PixhawkVehicle {
    config: PixhawkConfig,
    version: MavlinkVersion,
    interface: Option<PixhawkInterface>,
    state_tx: Arc<watch::Sender<VehicleState>>,
    state_rx: watch::Receiver<VehicleState>,
    layout_tx: watch::Sender<MissionLayout>,
    msg_tx: broadcast::Sender<apm::MavMessage>,
    event_task: Option<(CancellationToken, JoinHandle<anyhow::Result<()>>)>,
    /// Set once the autopilot accepted a return while armed
    returning: bool,
}

impl PixhawkVehicle {
    pub fn new(config: PixhawkConfig) -> anyhow::Result<Self> {
        let version = parse_version(&config.mavlink)?;
        let (state_tx, state_rx) = watch::channel(VehicleState::default());
        let (layout_tx, _) = watch::channel(MissionLayout::default());
        let (msg_tx, _) = broadcast::channel(256);

        Ok(PixhawkVehicle {
            config,
            version,
            interface: None,
            state_tx: Arc::new(state_tx),
            state_rx,
            layout_tx,
            msg_tx,
            event_task: None,
            returning: false,
        })
    }

    fn interface(&self) -> anyhow::Result<&PixhawkInterface> {
        self.interface.as_ref().context("not connected to the pixhawk")
    }

    fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_s)
    }

    /// Waits for the first message `select` picks out of the stream.
    async fn wait_for_message<T, F: FnMut(&apm::MavMessage) -> Option<T>>(
        &self,
        rx: &mut broadcast::Receiver<apm::MavMessage>,
        mut select: F,
    ) -> anyhow::Result<T> {
        let wait = async {
            loop {
                let message = rx.recv_skip().await.context("pixhawk link closed")?;
                if let Some(value) = select(&message) {
                    return Ok::<_, anyhow::Error>(value);
                }
            }
        };

        tokio::time::timeout(self.ack_timeout(), wait)
            .await
            .context("Timeout occurred while waiting for a message from the Pixhawk.")?
    }

    /// Sends a command and waits for acknowledgement.
    pub async fn send_command(
        &self,
        command: apm::MavCmd,
        params: [f32; 7],
    ) -> anyhow::Result<apm::MavResult> {
        debug!("sending command {:?} ({:?})", command, params);

        let message = apm::MavMessage::COMMAND_LONG(apm::COMMAND_LONG_DATA {
            command,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
            target_system: self.config.target_system,
            target_component: self.config.target_component,
        });

        let mut rx = self.msg_tx.subscribe();
        self.interface()?.send(&message).await?;

        debug!("sent command, waiting for ack");

        let result = self
            .wait_for_message(&mut rx, |message| match message {
                apm::MavMessage::COMMAND_ACK(data) if data.command == command => {
                    Some(data.result)
                }
                _ => None,
            })
            .await
            .with_context(|| format!("no acknowledgement for {:?}", command))?;

        debug!("received ack");

        match result {
            apm::MavResult::MAV_RESULT_ACCEPTED | apm::MavResult::MAV_RESULT_IN_PROGRESS => {
                Ok(result)
            }
            _ => Err(anyhow::anyhow!(
                "Command {:?} failed with status code {:?}",
                command,
                result
            )),
        }
    }
}

impl Drop for PixhawkVehicle {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.event_task.take() {
            cancel.cancel();
        }
    }
}

enum UploadStep {
    Request(u16),
    Ack(apm::MavMissionResult),
}

#[async_trait]
impl Vehicle for PixhawkVehicle {
    fn name(&self) -> &'static str {
        "pixhawk"
    }

    fn state(&self) -> watch::Receiver<VehicleState> {
        self.state_rx.clone()
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        let (interface, reader) = PixhawkInterface::connect(self.config.address, self.version)
            .await
            .context("failed to connect to pixhawk")?;

        let cancel = CancellationToken::new();
        let task = EventTask {
            reader,
            autopilot: Autopilot::from(&self.config),
            state_tx: self.state_tx.clone(),
            layout_rx: self.layout_tx.subscribe(),
            msg_tx: self.msg_tx.clone(),
        };
        let handle = spawn_task(Box::new(task), cancel.clone());

        self.interface = Some(interface);
        self.event_task = Some((cancel, handle));

        info!("waiting for heartbeat");
        let mut rx = self.state_rx.clone();
        wait_for_state(&mut rx, |s| s.connected).await?;
        info!("received heartbeat");

        Ok(())
    }

    async fn await_ready(&mut self) -> anyhow::Result<()> {
        info!("waiting for a good GPS lock and home position");
        let mut rx = self.state_rx.clone();
        wait_for_state(&mut rx, |s| s.is_ready()).await?;
        info!("GPS and home position ok");
        Ok(())
    }

    async fn upload_plan(&mut self, plan: &MissionPlan) -> anyhow::Result<()> {
        let (items, layout) =
            mission_items(plan, self.config.target_system, self.config.target_component);

        info!("uploading mission with {} items", items.len());

        let mut rx = self.msg_tx.subscribe();

        self.interface()?
            .send(&apm::MavMessage::MISSION_COUNT(apm::MISSION_COUNT_DATA {
                count: items.len() as u16,
                target_system: self.config.target_system,
                target_component: self.config.target_component,
                ..Default::default()
            }))
            .await?;

        loop {
            let step = self
                .wait_for_message(&mut rx, |message| match message {
                    apm::MavMessage::MISSION_REQUEST_INT(data) => {
                        Some(UploadStep::Request(data.seq))
                    }
                    apm::MavMessage::MISSION_REQUEST(data) => Some(UploadStep::Request(data.seq)),
                    apm::MavMessage::MISSION_ACK(data) => Some(UploadStep::Ack(data.mavtype)),
                    _ => None,
                })
                .await
                .context("mission upload stalled")?;

            match step {
                UploadStep::Request(seq) => {
                    let item = items
                        .get(seq as usize)
                        .with_context(|| format!("autopilot requested unknown item {seq}"))?;

                    trace!("sending mission item {seq}");
                    self.interface()?
                        .send(&apm::MavMessage::MISSION_ITEM_INT(item.clone()))
                        .await?;
                }
                UploadStep::Ack(apm::MavMissionResult::MAV_MISSION_ACCEPTED) => break,
                UploadStep::Ack(result) => bail!("mission upload rejected: {:?}", result),
            }
        }

        let len = plan.len();
        self.layout_tx.send_modify(|l| *l = layout);
        self.state_tx.send_modify(|s| s.mission_len = len);

        info!("mission uploaded");
        Ok(())
    }

    async fn arm(&mut self) -> anyhow::Result<()> {
        self.send_command(
            apm::MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [1., 0., 0., 0., 0., 0., 0.],
        )
        .await?;
        Ok(())
    }

    async fn start_mission(&mut self) -> anyhow::Result<()> {
        self.send_command(
            apm::MavCmd::MAV_CMD_MISSION_START,
            [0., 0., 0., 0., 0., 0., 0.],
        )
        .await?;

        self.state_tx
            .send_modify(|s| s.advance_to(MissionIndex::Active(0)));
        Ok(())
    }

    async fn is_finished(&mut self) -> anyhow::Result<bool> {
        if let Some((_, handle)) = &self.event_task {
            if handle.is_finished() {
                bail!("pixhawk link is down");
            }
        }

        Ok(self.state_rx.borrow().is_finished())
    }

    async fn return_to_launch(&mut self) -> anyhow::Result<()> {
        self.send_command(
            apm::MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
            [0., 0., 0., 0., 0., 0., 0.],
        )
        .await?;

        // the return is over when the autopilot disarms after landing, which
        // cannot be told apart from a vehicle that was never armed
        if !self.state_rx.borrow().armed {
            bail!("autopilot reports disarmed after accepting the return");
        }

        self.returning = true;
        Ok(())
    }

    async fn await_returned(&mut self) -> anyhow::Result<()> {
        if !self.returning {
            bail!("no return to launch in progress");
        }

        let mut rx = self.state_rx.clone();
        wait_for_state(&mut rx, |s| !s.armed).await?;

        self.returning = false;
        self.state_tx.send_modify(|s| s.returned = true);
        Ok(())
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        if let Some((cancel, handle)) = self.event_task.take() {
            cancel.cancel();
            handle.await.context("pixhawk event task panicked")??;
        }

        self.interface = None;
        self.state_tx.send_modify(|s| s.connected = false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::state::tests::waypoint;

    const AUTOPILOT: Autopilot = Autopilot {
        system: 1,
        component: 1,
    };

    const FROM_AUTOPILOT: MavHeader = MavHeader {
        system_id: 1,
        component_id: 1,
        sequence: 0,
    };

    fn apply(state: &mut VehicleState, layout: &MissionLayout, message: &apm::MavMessage) {
        apply_message(state, layout, AUTOPILOT, &FROM_AUTOPILOT, message);
    }

    fn heartbeat(armed: bool) -> apm::MavMessage {
        apm::MavMessage::HEARTBEAT(apm::HEARTBEAT_DATA {
            mavtype: apm::MavType::MAV_TYPE_QUADROTOR,
            autopilot: apm::MavAutopilot::MAV_AUTOPILOT_PX4,
            base_mode: if armed {
                apm::MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED
                    | apm::MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
            } else {
                apm::MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
            },
            // px4 keeps reporting standby for a while after arming
            system_status: apm::MavState::MAV_STATE_STANDBY,
            ..Default::default()
        })
    }

    fn ground_station_heartbeat() -> apm::MavMessage {
        apm::MavMessage::HEARTBEAT(apm::HEARTBEAT_DATA {
            mavtype: apm::MavType::MAV_TYPE_GCS,
            autopilot: apm::MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: apm::MavModeFlag::empty(),
            system_status: apm::MavState::MAV_STATE_UNINIT,
            ..Default::default()
        })
    }

    fn plan() -> MissionPlan {
        let mut photo = waypoint(47.3982413381, 8.54475557926);
        photo.camera_action = CameraAction::TakePhoto;
        photo.fly_through = false;
        photo.loiter_s = 4.0;

        MissionPlan::new(vec![
            waypoint(47.3981703271, 8.54564902186),
            photo,
            waypoint(47.3981393638, 8.54538461551),
        ])
        .unwrap()
    }

    #[test]
    fn items_map_back_to_waypoints() {
        let (items, layout) = mission_items(&plan(), 1, 1);

        // speed + nav per waypoint, plus one camera item
        assert_eq!(items.len(), 7);
        for (seq, item) in items.iter().enumerate() {
            assert_eq!(item.seq as usize, seq);
        }

        let waypoints: Vec<_> = (0..7).map(|seq| layout.waypoint_for(seq).unwrap()).collect();
        assert_eq!(waypoints, vec![0, 0, 1, 1, 1, 2, 2]);
        assert_eq!(layout.waypoint_for(7), None);

        assert!(layout.is_final(6));
        assert!(!layout.is_final(5));

        assert_eq!(items[0].current, 1);
        assert_eq!(items[1].current, 0);
    }

    #[test]
    fn nav_items_carry_position_and_hold() {
        let (items, _) = mission_items(&plan(), 1, 1);

        let nav = &items[1];
        assert_eq!(nav.command, apm::MavCmd::MAV_CMD_NAV_WAYPOINT);
        assert_eq!(nav.x, 473981703);
        assert_eq!(nav.y, 85456490);
        assert_eq!(nav.z, 20.0);
        assert_eq!(nav.param1, 0.0);

        let held = &items[3];
        assert_eq!(held.command, apm::MavCmd::MAV_CMD_NAV_WAYPOINT);
        assert_eq!(held.param1, 4.0);

        assert_eq!(items[2].command, apm::MavCmd::MAV_CMD_DO_CHANGE_SPEED);
        assert_eq!(items[2].param2, 5.0);
        assert_eq!(items[4].command, apm::MavCmd::MAV_CMD_IMAGE_START_CAPTURE);
    }

    #[test]
    fn progress_only_moves_once_started() {
        let (_, layout) = mission_items(&plan(), 1, 1);
        let mut state = VehicleState::default();

        let current = |seq| {
            apm::MavMessage::MISSION_CURRENT(apm::MISSION_CURRENT_DATA {
                seq,
                ..Default::default()
            })
        };
        let reached = |seq| {
            apm::MavMessage::MISSION_ITEM_REACHED(apm::MISSION_ITEM_REACHED_DATA { seq })
        };

        apply(&mut state, &layout, &current(0));
        assert_eq!(state.mission_index, MissionIndex::NotStarted);

        state.advance_to(MissionIndex::Active(0));
        apply(&mut state, &layout, &current(3));
        assert_eq!(state.mission_index, MissionIndex::Active(1));

        apply(&mut state, &layout, &reached(3));
        assert_eq!(state.mission_index, MissionIndex::Active(1));

        apply(&mut state, &layout, &reached(6));
        assert_eq!(state.mission_index, MissionIndex::Finished);

        apply(&mut state, &layout, &current(0));
        assert_eq!(state.mission_index, MissionIndex::Finished);
    }

    #[test]
    fn position_and_home_make_the_vehicle_ready() {
        let layout = MissionLayout::default();
        let mut state = VehicleState::default();

        apply(
            &mut state,
            &layout,
            &apm::MavMessage::GLOBAL_POSITION_INT(apm::GLOBAL_POSITION_INT_DATA {
                lat: 0,
                lon: 0,
                ..Default::default()
            }),
        );
        assert!(!state.global_position_ok);

        apply(
            &mut state,
            &layout,
            &apm::MavMessage::GLOBAL_POSITION_INT(apm::GLOBAL_POSITION_INT_DATA {
                lat: 473981703,
                lon: 85456490,
                ..Default::default()
            }),
        );
        assert!(state.global_position_ok);
        assert!(!state.is_ready());

        apply(
            &mut state,
            &layout,
            &apm::MavMessage::HOME_POSITION(apm::HOME_POSITION_DATA {
                latitude: 473981703,
                longitude: 85456490,
                ..Default::default()
            }),
        );
        assert!(state.is_ready());
        assert_eq!(state.home, state.position);
    }

    #[test]
    fn heartbeat_tracks_the_armed_flag() {
        let layout = MissionLayout::default();
        let mut state = VehicleState::default();

        apply(&mut state, &layout, &heartbeat(true));
        assert!(state.connected);
        assert!(state.armed);

        apply(&mut state, &layout, &heartbeat(false));
        assert!(!state.armed);
    }

    #[test]
    fn other_heartbeats_leave_the_vehicle_alone() {
        let layout = MissionLayout::default();
        let mut state = VehicleState::default();
        apply(&mut state, &layout, &heartbeat(true));

        let gcs = MavHeader {
            system_id: 255,
            component_id: 190,
            sequence: 7,
        };
        let beacon = ground_station_heartbeat();
        apply_message(&mut state, &layout, AUTOPILOT, &gcs, &beacon);
        assert!(state.armed);

        // a camera on the vehicle itself
        let camera = MavHeader {
            system_id: 1,
            component_id: 100,
            sequence: 3,
        };
        apply_message(&mut state, &layout, AUTOPILOT, &camera, &heartbeat(false));
        assert!(state.armed);

        // the autopilot's component id with an invalid autopilot type
        apply(&mut state, &layout, &ground_station_heartbeat());
        assert!(state.armed);

        // positions from another vehicle on the link
        let other_vehicle = MavHeader {
            system_id: 2,
            component_id: 1,
            sequence: 0,
        };
        apply_message(
            &mut state,
            &layout,
            AUTOPILOT,
            &other_vehicle,
            &apm::MavMessage::GLOBAL_POSITION_INT(apm::GLOBAL_POSITION_INT_DATA {
                lat: 473981703,
                lon: 85456490,
                ..Default::default()
            }),
        );
        assert_eq!(state.position, None);
    }

    #[test]
    fn trailing_camera_command_ends_the_mission() {
        let mut last = waypoint(47.3981393638, 8.54538461551);
        last.camera_action = CameraAction::TakePhoto;
        let plan = MissionPlan::new(vec![waypoint(47.3981703271, 8.54564902186), last]).unwrap();

        let (items, layout) = mission_items(&plan, 1, 1);
        assert_eq!(items.len(), 5);
        assert_eq!(items[4].command, apm::MavCmd::MAV_CMD_IMAGE_START_CAPTURE);

        let mut state = VehicleState::default();
        state.advance_to(MissionIndex::Active(0));

        // reaching the final waypoint is not enough, the photo is still due
        apply(
            &mut state,
            &layout,
            &apm::MavMessage::MISSION_ITEM_REACHED(apm::MISSION_ITEM_REACHED_DATA { seq: 3 }),
        );
        assert_eq!(state.mission_index, MissionIndex::Active(0));

        apply(
            &mut state,
            &layout,
            &apm::MavMessage::MISSION_CURRENT(apm::MISSION_CURRENT_DATA {
                seq: 4,
                ..Default::default()
            }),
        );
        assert_eq!(state.mission_index, MissionIndex::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn return_ends_when_the_autopilot_disarms() {
        let mut vehicle = PixhawkVehicle::new(PixhawkConfig::default()).unwrap();
        assert!(vehicle.await_returned().await.is_err());

        let state_tx = vehicle.state_tx.clone();
        let layout = MissionLayout::default();
        let armed = heartbeat(true);
        assert!(publish(&state_tx, &layout, AUTOPILOT, &FROM_AUTOPILOT, &armed));
        vehicle.returning = true;

        let link = tokio::spawn(async move {
            let gcs = MavHeader {
                system_id: 255,
                component_id: 190,
                sequence: 0,
            };

            let beacon = ground_station_heartbeat();
            let disarmed = heartbeat(false);

            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(!publish(&state_tx, &layout, AUTOPILOT, &gcs, &beacon));

            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(publish(&state_tx, &layout, AUTOPILOT, &FROM_AUTOPILOT, &disarmed));
        });

        let started = Instant::now();
        vehicle.await_returned().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(vehicle.state().borrow().returned);

        link.await.unwrap();
    }
}
