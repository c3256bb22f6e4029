//! Encoder output packets

/// An owning handle to one encoder output packet
///
/// Timestamps are in the producing encoder's codec time-base until the muxer
/// worker rescales them. The payload travels with the envelope; handing the
/// envelope to a container writer moves ownership of the bytes with it.
#[derive(Debug, Clone)]
pub struct PacketEnvelope {
    /// Encoded payload
    pub data: Vec<u8>,
    /// Presentation timestamp, if the encoder set one
    pub pts: Option<i64>,
    /// Decode timestamp, if the encoder set one
    pub dts: Option<i64>,
    /// Duration of the content, 0 if unknown
    pub duration: i64,
    /// Destination stream; assigned by the muxer worker before writing
    pub stream_index: usize,
    /// Whether the packet starts with a sync sample
    pub keyframe: bool,
}

impl PacketEnvelope {
    /// A packet with payload and presentation time only
    pub fn new(data: Vec<u8>, pts: i64) -> Self {
        Self {
            data,
            pts: Some(pts),
            dts: None,
            duration: 0,
            stream_index: 0,
            keyframe: false,
        }
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn keyframe(mut self) -> Self {
        self.keyframe = true;
        self
    }
}
