use crate::binary::jid::Jid;
use crate::crypto::key_pair::PreKey;
use crate::proto::AdvSignedDeviceIdentity;
use crate::store::AuthCreds;

/// Every credential mutation goes through a command so call sites stay
/// auditable and the store can emit a single `creds.update` per change.
#[derive(Debug, Clone)]
pub enum DeviceCommand {
    SetMe(Option<Jid>),
    SetLid(Option<Jid>),
    SetPushName(String),
    SetPlatform(String),
    SetAccount(Option<AdvSignedDeviceIdentity>),
    SetRegistered(bool),
    SetAdvSecretKey([u8; 32]),
    SetSignedPreKey(PreKey),
    SetNextPreKeyId(u32),
    SetFirstUnuploadedPreKeyId(u32),
    SetRoutingInfo(Option<Vec<u8>>),
    SetLastPropHash(Option<String>),
}

pub fn apply_command(creds: &mut AuthCreds, command: DeviceCommand) {
    match command {
        DeviceCommand::SetMe(me) => creds.me = me,
        DeviceCommand::SetLid(lid) => creds.lid = lid,
        DeviceCommand::SetPushName(name) => creds.push_name = name,
        DeviceCommand::SetPlatform(platform) => creds.platform = platform,
        DeviceCommand::SetAccount(account) => creds.account = account,
        DeviceCommand::SetRegistered(registered) => creds.registered = registered,
        DeviceCommand::SetAdvSecretKey(key) => creds.adv_secret_key = key,
        DeviceCommand::SetSignedPreKey(spk) => creds.signed_pre_key = spk,
        DeviceCommand::SetNextPreKeyId(id) => creds.next_pre_key_id = id,
        DeviceCommand::SetFirstUnuploadedPreKeyId(id) => creds.first_unuploaded_pre_key_id = id,
        DeviceCommand::SetRoutingInfo(info) => creds.routing_info = info,
        DeviceCommand::SetLastPropHash(hash) => creds.last_prop_hash = hash,
    }
}
