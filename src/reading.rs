use crate::attribute::DeviceAttr;
use crate::chardev::{ChannelFile, IoError};
use crate::control::Control;
#[cfg(feature = "dataframe")]
use polars::prelude::*;

/// One acquired block: its control and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReading {
    pub control: Control,
    pub data: Vec<u8>,
}

#[cfg(feature = "dataframe")]
const SAMPLE_COLUMN_NAME: &str = "sample";
#[cfg(feature = "dataframe")]
const TIME_COLUMN_NAME: &str = "time";

impl BlockReading {
    /// Read the next control from `ctrl` and the payload it announces
    /// from `data`. Both files must belong to the same input channel.
    pub fn read_from(ctrl: &mut ChannelFile, data: &mut ChannelFile) -> Result<Self, IoError> {
        let control = ctrl.read_control()?;
        let mut payload = vec![0; control.datalen()];
        let mut filled = 0;
        while filled < payload.len() {
            let n = data.read(&mut payload[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        payload.truncate(filled);
        Ok(Self {
            control,
            data: payload,
        })
    }

    /// Samples as signed little-endian integers of the control's sample
    /// size. Sizes other than 1, 2, 4 and 8 bytes yield nothing.
    pub fn samples(&self) -> Vec<i64> {
        let data = &self.data;
        match self.control.ssize {
            1 => data.iter().map(|b| i64::from(*b as i8)).collect(),
            2 => data
                .chunks_exact(2)
                .filter_map(|c| c.try_into().ok().map(i16::from_le_bytes))
                .map(i64::from)
                .collect(),
            4 => data
                .chunks_exact(4)
                .filter_map(|c| c.try_into().ok().map(i32::from_le_bytes))
                .map(i64::from)
                .collect(),
            8 => data
                .chunks_exact(8)
                .filter_map(|c| c.try_into().ok().map(i64::from_le_bytes))
                .collect(),
            other => {
                log::warn!("cannot decode samples of {other} bytes");
                Vec::new()
            }
        }
    }

    /// Samples per second, from the `max-sample-rate` attribute.
    pub fn sample_rate(&self) -> Option<u32> {
        self.control
            .attr_channel
            .std(DeviceAttr::MaxSampleRate.index())
            .filter(|rate| *rate > 0)
    }

    /// `time` and `sample` columns. Without a sample rate, time counts
    /// samples.
    #[cfg(feature = "dataframe")]
    pub fn to_lazyframe(&self) -> Result<LazyFrame, PolarsError> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("to_lazyframe"), 0));

        let period = self.sample_rate().map_or(1.0, |rate| 1.0 / f64::from(rate));
        let samples: Column = Series::new(SAMPLE_COLUMN_NAME.into(), self.samples()).into();
        let df = DataFrame::new(vec![samples])?
            .lazy()
            .with_row_index("row_index", Some(0))
            .with_columns([
                (col("row_index").cast(DataType::Float64) * lit(period)).alias(TIME_COLUMN_NAME),
            ])
            .select([col(TIME_COLUMN_NAME), col(SAMPLE_COLUMN_NAME)]);
        Ok(df)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chardev::{OpenFlags, Stream};
    use crate::test_support::{input_device, MockDriver};

    fn reading(ssize: u16, data: Vec<u8>) -> BlockReading {
        let mut control = Control::new();
        control.ssize = ssize;
        control.nsamples = (data.len() / ssize as usize) as u32;
        BlockReading { control, data }
    }

    #[test]
    fn test_samples_signed_little_endian() {
        assert_eq!(reading(1, vec![0x01, 0xff]).samples(), [1, -1]);
        assert_eq!(reading(2, vec![0x34, 0x12, 0xfe, 0xff]).samples(), [0x1234, -2]);
        assert_eq!(
            reading(4, vec![0, 0, 0, 0x80]).samples(),
            [i64::from(i32::MIN)]
        );
        assert_eq!(reading(8, (-5i64).to_le_bytes().to_vec()).samples(), [-5]);
        assert!(reading(3, vec![1, 2, 3]).samples().is_empty());
    }

    #[test]
    fn test_read_from_channel() {
        let (_reg, dev) = input_device(MockDriver::new(), 1, 4);
        let chan = dev.channel(0, 0).unwrap();
        let mut ctrl = chan.open(Stream::Control, OpenFlags::default()).unwrap();
        let mut data = chan.open(Stream::Data, OpenFlags::default()).unwrap();

        let block = BlockReading::read_from(&mut ctrl, &mut data).unwrap();
        assert_eq!(block.data.len(), 32);
        assert_eq!(block.samples(), vec![0x0101; 16]);
        assert_eq!(block.sample_rate(), Some(1_000_000));
    }

    #[cfg(feature = "dataframe")]
    #[test]
    fn test_lazyframe_time_column() {
        let mut block = reading(2, vec![1, 0, 2, 0, 3, 0]);
        block.control.attr_channel.set_std(DeviceAttr::MaxSampleRate.index(), 1000);
        let df = block.to_lazyframe().unwrap().collect().unwrap();
        assert_eq!(df.height(), 3);
        let time = df.column(TIME_COLUMN_NAME).unwrap().f64().unwrap();
        assert_eq!(time.get(2), Some(0.002));
        let sample = df.column(SAMPLE_COLUMN_NAME).unwrap().i64().unwrap();
        assert_eq!(sample.get(1), Some(2));
    }
}
