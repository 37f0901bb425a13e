use super::types::InstanceStatus;

pub fn valid_status_transition(src: InstanceStatus, dst: InstanceStatus) -> bool {
    use InstanceStatus::*;

    let allowed: &[InstanceStatus] = match src {
        Pending => &[Running, Error, Removed],
        Running => &[Running, Stopped, Error, Removed],
        Stopped => &[Running, Removed],
        Error => &[Removed],
        Removed => &[],
    };

    allowed.contains(&dst)
}
