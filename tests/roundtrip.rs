//! End-to-end mux/demux round trips across every container this engine speaks, plus the
//! trim operator applied to a demuxed MP4 track.

use containerfmt::data::Data;
use containerfmt::editbox::{self, EditBox, EditType};
use containerfmt::media::Media;
use containerfmt::reader::{MemoryReader, SharedReader};
use containerfmt::sample::{Sample, SampleKind};
use containerfmt::settings::{AudioCodec, AudioSettings, Orientation, SpsPps, VideoCodec, VideoSettings};
use std::sync::Arc;

fn shared_reader(data: Vec<u8>) -> SharedReader {
    SharedReader::new(Arc::new(MemoryReader::new(Data::from_vec(data))))
}

fn h264_sps_pps() -> SpsPps {
    SpsPps {
        sps: Data::from_vec(vec![0x67, 0x4d, 0x00, 0x1f, 0xAA]),
        pps: Data::from_vec(vec![0x68, 0xee, 0x3c, 0x80]),
        nalu_length_size: 4,
    }
}

fn avcc_nal(bytes: &[u8]) -> Vec<u8> {
    let mut out = (bytes.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(bytes);
    out
}

#[test]
fn mp4_round_trip_preserves_video_audio_edits_and_captions() {
    use containerfmt::mp4::{self, AudioTrackInput, MuxInput, OutputMode, VideoTrackInput};

    let video_settings = VideoSettings::square_pixel(VideoCodec::H264, 1280, 720, 90_000, Orientation::Landscape, h264_sps_pps());
    let video_samples = vec![
        Sample::from_data(0, 0, true, SampleKind::Video, Data::from_vec(avcc_nal(&[0x65, 1, 2, 3]))),
        Sample::from_data(3000, 3000, false, SampleKind::Video, Data::from_vec(avcc_nal(&[0x41, 4, 5]))),
        Sample::from_data(6000, 6000, false, SampleKind::Video, Data::from_vec(avcc_nal(&[0x41, 6, 7]))),
    ];
    let video_edits = vec![EditBox::new(3000, 6000, 1.0, EditType::Normal)];

    let audio_settings = AudioSettings { codec: AudioCodec::AacLc, timescale: 44_100, sample_rate: 44_100, channels: 2, bitrate: 128_000 };
    let audio_samples = vec![
        Sample::from_data(0, 0, true, SampleKind::Audio, Data::from_vec(vec![0xAB; 12])),
        Sample::from_data(1024, 1024, true, SampleKind::Audio, Data::from_vec(vec![0xCD; 12])),
    ];

    let captions = vec![Sample::from_data(0, 0, true, SampleKind::Caption, Data::from_vec(b"hello".to_vec()))];

    let input = MuxInput {
        video: Some(VideoTrackInput { settings: &video_settings, samples: &video_samples, edits: &video_edits }),
        audio: Some(AudioTrackInput { settings: &audio_settings, samples: &audio_samples, edits: &[] }),
        captions: Some(&captions),
    };
    let out = mp4::mux(&input, OutputMode::Regular).unwrap();

    let demuxed = mp4::demux(shared_reader(out)).unwrap();

    let video = demuxed.video.expect("video track");
    assert_eq!(video.settings().coded_width, 1280);
    assert_eq!(video.settings().coded_height, 720);
    let decoded_video: Vec<Sample> = video.iter().collect();
    assert_eq!(decoded_video.len(), 3);
    assert!(decoded_video[0].keyframe);
    assert!(!decoded_video[1].keyframe);
    assert_eq!(decoded_video[0].payload().unwrap().as_slice(), video_samples[0].payload().unwrap().as_slice());

    assert_eq!(demuxed.video_edits.len(), 1);
    assert_eq!(demuxed.video_edits[0].start_pts, 3000);
    assert_eq!(editbox::real_pts(&demuxed.video_edits, 3000).unwrap(), Some(0));
    assert_eq!(editbox::real_pts(&demuxed.video_edits, 9000).unwrap(), None);

    let audio = demuxed.audio.expect("audio track");
    assert_eq!(audio.settings().sample_rate, 44_100);
    assert_eq!(audio.settings().channels, 2);
    let decoded_audio: Vec<Sample> = audio.iter().collect();
    assert_eq!(decoded_audio.len(), 2);

    let captions_track = demuxed.captions.expect("caption track");
    let decoded_captions: Vec<Sample> = captions_track.iter().collect();
    assert_eq!(decoded_captions.len(), 1);
    assert_eq!(decoded_captions[0].payload().unwrap().as_slice(), b"hello");
}

#[test]
fn mp2ts_round_trip_preserves_video_and_audio() {
    use containerfmt::mp2ts::{self, AudioTrackInput, MuxInput, VideoTrackInput};

    let video_settings = VideoSettings::square_pixel(
        VideoCodec::H264,
        1280,
        720,
        containerfmt::limits::MP2TS_TIMESCALE,
        Orientation::Unknown,
        h264_sps_pps(),
    );
    let video_samples = vec![
        Sample::from_data(0, 0, true, SampleKind::Video, Data::from_vec(avcc_nal(&[0x65, 1, 2, 3]))),
        Sample::from_data(3000, 3000, false, SampleKind::Video, Data::from_vec(avcc_nal(&[0x41, 4, 5]))),
    ];

    let audio_settings = AudioSettings { codec: AudioCodec::AacLc, timescale: 90_000, sample_rate: 44_100, channels: 2, bitrate: 0 };
    let audio_samples = vec![Sample::from_data(0, 0, true, SampleKind::Audio, Data::from_vec(vec![0xAB; 50]))];

    let input = MuxInput {
        video: Some(VideoTrackInput { settings: &video_settings, samples: &video_samples }),
        audio: Some(AudioTrackInput { settings: &audio_settings, samples: &audio_samples }),
        data: None,
        captions: None,
    };
    let out = mp2ts::mux(&input).unwrap();

    let demuxed = mp2ts::demux(shared_reader(out)).unwrap();

    let video = demuxed.video.expect("video track");
    let decoded_video: Vec<Sample> = video.iter().collect();
    assert_eq!(decoded_video.len(), 2);
    assert!(decoded_video[0].keyframe);
    assert!(!decoded_video[1].keyframe);

    let audio = demuxed.audio.expect("audio track");
    let decoded_audio: Vec<Sample> = audio.iter().collect();
    assert_eq!(decoded_audio.len(), 1);
}

#[test]
fn trim_applied_to_a_demuxed_mp4_track_windows_playback_time() {
    use containerfmt::mp4::{self, MuxInput, OutputMode, VideoTrackInput};
    use containerfmt::trim;

    let settings = VideoSettings::square_pixel(VideoCodec::H264, 640, 480, 1000, Orientation::Landscape, h264_sps_pps());
    let samples = vec![
        Sample::from_data(0, 0, true, SampleKind::Video, Data::from_vec(avcc_nal(&[0x65, 0]))),
        Sample::from_data(500, 500, false, SampleKind::Video, Data::from_vec(avcc_nal(&[0x41, 1]))),
        Sample::from_data(999, 999, false, SampleKind::Video, Data::from_vec(avcc_nal(&[0x41, 2]))),
        Sample::from_data(1000, 1000, true, SampleKind::Video, Data::from_vec(avcc_nal(&[0x65, 3]))),
        Sample::from_data(1500, 1500, false, SampleKind::Video, Data::from_vec(avcc_nal(&[0x41, 4]))),
    ];
    let input = MuxInput {
        video: Some(VideoTrackInput { settings: &settings, samples: &samples, edits: &[] }),
        audio: None,
        captions: None,
    };
    let out = mp4::mux(&input, OutputMode::Regular).unwrap();
    let demuxed = mp4::demux(shared_reader(out)).unwrap();
    let video = demuxed.video.expect("video track");

    let (trimmed, new_edits) = trim::trim(&video, &demuxed.video_edits, 1000, 500, 1000).unwrap();

    let pts: Vec<i64> = trimmed.to_vec().iter().map(|s| s.pts).collect();
    assert_eq!(pts, vec![500, 999, 1000]);

    // the trimmed track's own playback pts starts at 0, not at the 500ms window start.
    assert_eq!(editbox::real_pts(&new_edits, 500).unwrap(), Some(0));
    assert_eq!(editbox::real_pts(&new_edits, 1000).unwrap(), Some(500));
    assert_eq!(editbox::real_pts(&new_edits, 1500).unwrap(), None);
}

#[test]
fn webm_round_trip_preserves_vp8_video_and_vorbis_audio() {
    use containerfmt::settings::{AudioKind, VideoKind};
    use containerfmt::webm;

    let video_settings = VideoSettings::square_pixel(VideoCodec::Vp8, 320, 240, 100_000, Orientation::Landscape, SpsPps::none());
    let video_samples = vec![
        Sample::from_data(0, 0, true, SampleKind::Video, Data::from_vec(vec![0x10, 0x00, 0x9d])),
        Sample::from_data(3000, 3000, false, SampleKind::Video, Data::from_vec(vec![0x11, 0x00, 0x9d])),
    ];
    let video_track: Media<VideoKind, Sample> = Media::from_vec(video_settings, video_samples.clone());

    let audio_settings = AudioSettings { codec: AudioCodec::Vorbis, timescale: 48_000, sample_rate: 48_000, channels: 2, bitrate: 0 };
    let audio_samples = vec![
        Sample::from_data(0, 0, true, SampleKind::Audio, Data::from_vec(vec![0xAA; 8])),
        Sample::from_data(960, 960, true, SampleKind::Audio, Data::from_vec(vec![0xBB; 8])),
    ];
    let audio_track: Media<AudioKind, Sample> = Media::from_vec(audio_settings, audio_samples.clone());

    let out = webm::mux(Some(&video_track), Some(&audio_track)).unwrap();
    let demuxed = webm::demux(shared_reader(out)).unwrap();

    let video = demuxed.video.expect("video track");
    assert_eq!(video.settings().coded_width, 320);
    assert_eq!(video.settings().coded_height, 240);
    let decoded_video: Vec<Sample> = video.iter().collect();
    assert_eq!(decoded_video.len(), 2);
    assert!(decoded_video[0].keyframe);
    assert!(!decoded_video[1].keyframe);
    assert_eq!(decoded_video[0].payload().unwrap().as_slice(), video_samples[0].payload().unwrap().as_slice());

    let audio = demuxed.audio.expect("audio track");
    assert_eq!(audio.settings().sample_rate, 48_000);
    assert_eq!(audio.settings().channels, 2);
    let decoded_audio: Vec<Sample> = audio.iter().collect();
    assert_eq!(decoded_audio.len(), 2);
    assert!(audio.settings().bitrate > 0, "webm demux must compute audio bitrate from bytes/duration");
}
